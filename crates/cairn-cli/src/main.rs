use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use cairn_core::keys::KeyMaterial;
use cairn_core::resolve::Resolver;
use cairn_core::{
    BlobStore, ContentSecret, Decryptor, EncryptOptions, Encryptor, KeySet, Output,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "cairn: deduplicating, authenticated, compressed file backups"
)]
struct Cli {
    /// Encrypt the inputs. KEYFILE is a public keyfile (`cairn-keygen`) or
    /// any symmetric keyfile; omit the value to be prompted for a
    /// passphrase.
    #[arg(long, value_name = "KEYFILE", num_args = 0..=1, default_missing_value = "", conflicts_with = "decrypt")]
    encrypt: Option<String>,

    /// Decrypt the inputs (manifests and/or chunk names). KEYFILE is a
    /// private keyfile or the symmetric keyfile used for encryption; omit
    /// the value to be prompted for a passphrase.
    #[arg(long, value_name = "KEYFILE", num_args = 0..=1, default_missing_value = "")]
    decrypt: Option<String>,

    /// Print each manifest's archived files and their chunk names instead
    /// of restoring anything.
    #[arg(long)]
    dump_manifest: bool,

    /// Print each manifest's sorted chunk-name index. Works with just the
    /// public key (or the content secret).
    #[arg(long)]
    dump_manifest_index: bool,

    /// With --decrypt: delete each blob (and manifest) file after it has
    /// been decrypted, to conserve space.
    #[arg(long)]
    consume: bool,

    /// Where encrypted data goes: a comma-separated destination list, e.g.
    /// "local:/backup", "s3:my-bucket,b2:spare", or the path of an upload
    /// program. Default: the current directory.
    #[arg(long, value_name = "DESTS")]
    save_to: Option<String>,

    /// Split files into chunks of this size, e.g. "100MB" or "64KiB".
    #[arg(long, default_value = "100MB")]
    chunk_size: String,

    /// Zstd compression level used during encryption.
    #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(i32).range(1..=22))]
    compresslevel: i32,

    /// How many files to process in parallel.
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Record absolute paths in the manifest (for full-system backups).
    #[arg(long)]
    store_absolute_paths: bool,

    /// Prefix for the generated manifest filename.
    #[arg(long)]
    label: Option<String>,

    /// Files, directories, and glob patterns to back up -- or manifests,
    /// restrict filters, and chunk names to restore.
    #[arg(required = true)]
    inputs: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let out = Output::stdout();

    let decrypting =
        cli.decrypt.is_some() || cli.dump_manifest || cli.dump_manifest_index;
    let key_arg = if cli.decrypt.is_some() {
        cli.decrypt.as_deref()
    } else {
        cli.encrypt.as_deref()
    };
    let keys = KeySet::from_material(load_key_material(key_arg)?);

    if cli.dump_manifest {
        return dump_manifest(keys, out, &cli.inputs).await;
    }
    if cli.dump_manifest_index {
        return dump_manifest_index(keys, out, &cli.inputs).await;
    }
    if decrypting {
        return run_decrypt(keys, out, cli.consume, &cli.inputs).await;
    }
    run_encrypt(keys, out, &cli).await
}

/// Resolve the key argument: a keyfile path, or (empty/absent) an
/// interactive passphrase prompted twice.
fn load_key_material(arg: Option<&str>) -> Result<KeyMaterial> {
    match arg {
        Some(path) if !path.is_empty() => {
            KeyMaterial::load(std::path::Path::new(path)).map_err(Into::into)
        }
        _ => {
            let passphrase = loop {
                let first = rpassword::prompt_password("Password: ")
                    .context("passphrase prompt requires a terminal")?;
                let second = rpassword::prompt_password("Confirm: ")?;
                if first == second {
                    break first;
                }
                eprintln!("passwords did not match! Please try again.");
            };
            Ok(KeyMaterial::Symmetric(ContentSecret::from_passphrase(
                &passphrase,
            )?))
        }
    }
}

async fn run_encrypt(keys: KeySet, out: Output, cli: &Cli) -> Result<()> {
    let store = BlobStore::from_spec(cli.save_to.as_deref())?;
    let opts = EncryptOptions {
        chunk_size: parse_size(&cli.chunk_size)
            .with_context(|| format!("bad --chunk-size '{}'", cli.chunk_size))?,
        compresslevel: cli.compresslevel,
        concurrency: cli.concurrency,
        store_absolute_paths: cli.store_absolute_paths,
        label: cli.label.clone(),
        manifest_filename: None,
    };

    let encryptor = Encryptor::new(keys, store, out, opts);
    let report = encryptor.encrypt(&cli.inputs).await?;

    eprintln!(
        "{} -> {}",
        humansize::format_size(report.stored_bytes, humansize::BINARY),
        report.manifest_name
    );
    if !report.failures.is_empty() {
        bail!("{} file(s) failed to encrypt", report.failures.len());
    }
    Ok(())
}

async fn run_decrypt(
    keys: KeySet,
    out: Output,
    consume: bool,
    inputs: &[String],
) -> Result<()> {
    let decryptor = Decryptor::new(keys, out, consume);
    let report = decryptor.decrypt(inputs).await?;
    if !report.ok() {
        bail!("{} file(s) failed to decrypt", report.failures.len());
    }
    Ok(())
}

async fn dump_manifest(keys: KeySet, out: Output, inputs: &[String]) -> Result<()> {
    let decryptor = Decryptor::new(keys, out.clone(), false);
    let mut resolver = Resolver::new()?;
    for input in inputs {
        let resolved = resolver.resolve_input(input).await?;
        let mfn = decryptor.load_manifest(&resolved.path)?;
        eprintln!("*** {input}:");
        for (archived, entry) in &mfn {
            eprintln!("* {archived}:");
            for blob in &entry.blobs {
                out.line(blob);
            }
        }
    }
    Ok(())
}

async fn dump_manifest_index(keys: KeySet, out: Output, inputs: &[String]) -> Result<()> {
    let decryptor = Decryptor::new(keys, out.clone(), false);
    let mut resolver = Resolver::new()?;
    for input in inputs {
        let resolved = resolver.resolve_input(input).await?;
        eprintln!("*** {input}:");
        for blob in decryptor.load_manifest_index(&resolved.path)? {
            out.line(&blob);
        }
    }
    Ok(())
}

/// Parse "100MB"-style sizes. Decimal suffixes are powers of 1000, binary
/// suffixes (KiB, MiB, GiB) powers of 1024.
fn parse_size(input: &str) -> Result<usize> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let value: usize = digits.parse().context("expected a number")?;
    let multiplier: usize = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        other => bail!("unknown size suffix '{other}'"),
    };
    value
        .checked_mul(multiplier)
        .context("size overflows usize")
}
