//! Generate a hybrid ML-KEM-1024 + X25519 keypair for asymmetric backups.

use anyhow::{bail, Result};
use clap::Parser;

use cairn_core::scratch::set_secure_permissions;
use cairn_core::Keypair;

#[derive(Parser, Debug)]
#[command(author, version, about = "generate a cairn keypair")]
struct Cli {
    /// Basename for the keyfiles: writes <BASE>.pub and <BASE>.key
    #[arg(short, long, default_value = "cairn")]
    output: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let pub_path = format!("{}.pub", cli.output);
    let key_path = format!("{}.key", cli.output);
    for path in [&pub_path, &key_path] {
        if std::path::Path::new(path).exists() {
            bail!("{path} already exists, refusing to overwrite");
        }
    }

    let pair = Keypair::generate();
    std::fs::write(&pub_path, pair.public.keyfile_bytes())?;
    std::fs::write(&key_path, pair.secret.keyfile_bytes())?;
    set_secure_permissions(std::path::Path::new(&key_path))?;

    eprintln!("wrote {pub_path} (share for encryption)");
    eprintln!("wrote {key_path} (required for decryption -- keep it private)");
    Ok(())
}
