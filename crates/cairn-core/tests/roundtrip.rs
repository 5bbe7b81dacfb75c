//! End-to-end encrypt/decrypt round trips against a local blob store.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use filetime::FileTime;

use cairn_core::keys::{KeyMaterial, Keypair};
use cairn_core::{
    BlobStore, Decryptor, EncryptOptions, Encryptor, KeySet, Manifest, Output,
};

/// Decryption materializes files under the working directory, so tests that
/// move the process cwd serialize on this lock.
fn lock_cwd() -> MutexGuard<'static, ()> {
    static CWD: Mutex<()> = Mutex::new(());
    CWD.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn sink() -> Output {
    Output::new(Box::new(std::io::sink()))
}

fn write_with_times(path: &Path, contents: &[u8], secs: i64, nanos: u32) {
    std::fs::write(path, contents).unwrap();
    let stamp = FileTime::from_unix_time(secs, nanos);
    filetime::set_file_times(path, stamp, stamp).unwrap();
}

fn mtime_seconds(path: &Path) -> f64 {
    let meta = std::fs::metadata(path).unwrap();
    let ft = FileTime::from_last_modification_time(&meta);
    ft.unix_seconds() as f64 + f64::from(ft.nanoseconds()) / 1e9
}

fn local_store(root: &Path) -> BlobStore {
    BlobStore::from_spec(Some(&format!("local:{}", root.display()))).unwrap()
}

fn symmetric_keys(keyfile: &Path) -> KeySet {
    KeySet::from_material(KeyMaterial::load(keyfile).unwrap())
}

async fn encrypt_inputs(
    keys: KeySet,
    store_root: &Path,
    out: Output,
    inputs: &[String],
) -> cairn_core::EncryptReport {
    let encryptor = Encryptor::new(
        keys,
        local_store(store_root),
        out,
        EncryptOptions::default(),
    );
    let report = encryptor.encrypt(inputs).await.unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    report
}

#[tokio::test]
async fn symmetric_keyfile_round_trip() {
    let _cwd = lock_cwd();
    let base = tempfile::tempdir().unwrap();
    let store = base.path().join("store");

    let tiny = base.path().join("tiny_sample.txt");
    write_with_times(&tiny, b"aaaabbbb", 1552604385, 278964000);
    let another = base.path().join("another_sample.txt");
    write_with_times(&another, b"0123456789", 1358637058, 0);

    let keyfile = base.path().join("key.bin");
    std::fs::write(&keyfile, [7u8; 32]).unwrap();

    let capture = Capture::default();
    let report = encrypt_inputs(
        symmetric_keys(&keyfile),
        &store,
        Output::new(Box::new(capture.clone())),
        &[
            tiny.display().to_string(),
            another.display().to_string(),
        ],
    )
    .await;

    let names = capture.lines();
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
    for name in &names {
        assert_eq!(name.len(), 44);
        assert!(store.join(format!("data/{}/{}", &name[..2], name)).is_file());
    }
    assert!(store.join(&report.manifest_name).is_file());

    let restore = base.path().join("restore");
    std::fs::create_dir_all(&restore).unwrap();
    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&restore).unwrap();

    let decryptor = Decryptor::new(symmetric_keys(&keyfile), sink(), false);
    let mfn_url = format!("local://{}/{}", store.display(), report.manifest_name);
    let restored = decryptor.decrypt(&[mfn_url]).await.unwrap();
    std::env::set_current_dir(prev).unwrap();

    assert!(restored.ok(), "{:?}", restored.failures);
    assert_eq!(
        std::fs::read(restore.join("tiny_sample.txt")).unwrap(),
        b"aaaabbbb"
    );
    assert_eq!(
        std::fs::read(restore.join("another_sample.txt")).unwrap(),
        b"0123456789"
    );
    assert!(
        (mtime_seconds(&restore.join("tiny_sample.txt")) - 1552604385.278964).abs() < 1e-5
    );
    assert!(
        (mtime_seconds(&restore.join("another_sample.txt")) - 1358637058.0).abs() < 1e-5
    );
}

#[tokio::test]
async fn asymmetric_round_trip_with_index_privileges() {
    let _cwd = lock_cwd();
    let base = tempfile::tempdir().unwrap();
    let store = base.path().join("store");

    let pair = Keypair::generate();
    let pub_path = base.path().join("backup.pub");
    let key_path = base.path().join("backup.key");
    std::fs::write(&pub_path, pair.public.keyfile_bytes()).unwrap();
    std::fs::write(&key_path, pair.secret.keyfile_bytes()).unwrap();

    let source = base.path().join("notes.txt");
    write_with_times(&source, b"sealed with a kiss", 1600000000, 500000000);

    let capture = Capture::default();
    let report = encrypt_inputs(
        KeySet::from_material(KeyMaterial::load(&pub_path).unwrap()),
        &store,
        Output::new(Box::new(capture.clone())),
        &[source.display().to_string()],
    )
    .await;
    let names = capture.lines();
    let mfn_path = store.join(&report.manifest_name);

    // Holding only the public key: the index is readable, the body is not.
    let index_only = Decryptor::new(
        KeySet::from_material(KeyMaterial::load(&pub_path).unwrap()),
        sink(),
        false,
    );
    let index = index_only.load_manifest_index(&mfn_path).unwrap();
    let mut expected = names.clone();
    expected.sort();
    assert_eq!(index, expected);
    assert!(matches!(
        index_only.load_manifest(&mfn_path),
        Err(cairn_core::Error::CryptoAuth(_))
    ));

    // The private key restores everything.
    let restore = base.path().join("restore");
    std::fs::create_dir_all(&restore).unwrap();
    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&restore).unwrap();
    let decryptor = Decryptor::new(
        KeySet::from_material(KeyMaterial::load(&key_path).unwrap()),
        sink(),
        false,
    );
    let mfn_url = format!("local://{}/{}", store.display(), report.manifest_name);
    let restored = decryptor.decrypt(&[mfn_url]).await.unwrap();
    std::env::set_current_dir(prev).unwrap();

    assert!(restored.ok(), "{:?}", restored.failures);
    assert_eq!(
        std::fs::read(restore.join("notes.txt")).unwrap(),
        b"sealed with a kiss"
    );
}

#[tokio::test]
async fn zero_byte_file_round_trips_with_empty_blob_list() {
    let _cwd = lock_cwd();
    let base = tempfile::tempdir().unwrap();
    let store = base.path().join("store");

    let empty = base.path().join("hollow.dat");
    write_with_times(&empty, b"", 1500000000, 0);
    let keyfile = base.path().join("key.bin");
    std::fs::write(&keyfile, [9u8; 32]).unwrap();

    let report = encrypt_inputs(
        symmetric_keys(&keyfile),
        &store,
        sink(),
        &[empty.display().to_string()],
    )
    .await;

    let decryptor = Decryptor::new(symmetric_keys(&keyfile), sink(), false);
    let mfn = decryptor
        .load_manifest(&store.join(&report.manifest_name))
        .unwrap();
    assert_eq!(mfn.len(), 1);
    assert!(mfn["hollow.dat"].blobs.is_empty());

    let restore = base.path().join("restore");
    std::fs::create_dir_all(&restore).unwrap();
    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&restore).unwrap();
    let mfn_url = format!("local://{}/{}", store.display(), report.manifest_name);
    let restored = decryptor.decrypt(&[mfn_url]).await.unwrap();
    std::env::set_current_dir(prev).unwrap();

    assert!(restored.ok(), "{:?}", restored.failures);
    let out = restore.join("hollow.dat");
    assert_eq!(std::fs::metadata(&out).unwrap().len(), 0);
    assert!((mtime_seconds(&out) - 1500000000.0).abs() < 1e-5);
}

#[tokio::test]
async fn parent_escaping_inputs_archive_as_basenames() {
    let _cwd = lock_cwd();
    let base = tempfile::tempdir().unwrap();
    let store = base.path().join("store");
    let work = base.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(base.path().join("evil.txt"), b"outside the tree").unwrap();

    let keyfile = base.path().join("key.bin");
    std::fs::write(&keyfile, [3u8; 32]).unwrap();

    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&work).unwrap();
    let report = encrypt_inputs(
        symmetric_keys(&keyfile),
        &store,
        sink(),
        &["../evil.txt".to_string()],
    )
    .await;

    let decryptor = Decryptor::new(symmetric_keys(&keyfile), sink(), false);
    let mfn = decryptor
        .load_manifest(&store.join(&report.manifest_name))
        .unwrap();
    assert_eq!(mfn.keys().collect::<Vec<_>>(), vec!["evil.txt"]);

    let restore = base.path().join("restore");
    std::fs::create_dir_all(&restore).unwrap();
    std::env::set_current_dir(&restore).unwrap();
    let mfn_url = format!("local://{}/{}", store.display(), report.manifest_name);
    let restored = decryptor.decrypt(&[mfn_url]).await.unwrap();
    std::env::set_current_dir(prev).unwrap();

    assert!(restored.ok(), "{:?}", restored.failures);
    assert_eq!(
        std::fs::read(restore.join("evil.txt")).unwrap(),
        b"outside the tree"
    );
}

#[tokio::test]
async fn hostile_manifest_keys_cannot_escape_the_working_directory() {
    let _cwd = lock_cwd();
    let base = tempfile::tempdir().unwrap();

    let keyfile = base.path().join("key.bin");
    std::fs::write(&keyfile, [5u8; 32]).unwrap();
    let keys = symmetric_keys(&keyfile);

    let mut mfn = Manifest::new();
    mfn.insert(
        "../escape.txt".to_string(),
        cairn_core::FileEntry {
            blobs: vec![],
            atime: 0.0,
            mtime: 0.0,
        },
    );
    let bytes =
        cairn_core::manifest::encode_manifest(&mfn, &keys.data_box, &keys.index_box, 3)
            .unwrap();
    let mfn_path = base.path().join("hostile.mfn");
    std::fs::write(&mfn_path, bytes).unwrap();

    let restore = base.path().join("restore");
    std::fs::create_dir_all(&restore).unwrap();
    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&restore).unwrap();
    let decryptor = Decryptor::new(symmetric_keys(&keyfile), sink(), false);
    let report = decryptor
        .decrypt(&[mfn_path.display().to_string()])
        .await
        .unwrap();
    std::env::set_current_dir(prev).unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(!base.path().join("escape.txt").exists());
    assert!(!restore.join("escape.txt").exists());
}

#[tokio::test]
async fn consume_removes_blobs_and_manifest_after_restore() {
    let _cwd = lock_cwd();
    let base = tempfile::tempdir().unwrap();
    let work = base.path().join("work");
    std::fs::create_dir_all(&work).unwrap();

    let keyfile = base.path().join("key.bin");
    std::fs::write(&keyfile, [11u8; 32]).unwrap();

    std::fs::write(work.join("payload.bin"), b"consume me").unwrap();

    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&work).unwrap();

    // No destinations: blobs and the manifest land in the working dir.
    let capture = Capture::default();
    let encryptor = Encryptor::new(
        symmetric_keys(&keyfile),
        BlobStore::from_spec(None).unwrap(),
        Output::new(Box::new(capture.clone())),
        EncryptOptions::default(),
    );
    let report = encryptor
        .encrypt(&["payload.bin".to_string()])
        .await
        .unwrap();
    assert!(report.failures.is_empty());
    let blob_name = capture.lines().remove(0);
    assert!(work.join(&blob_name).is_file());
    assert!(work.join(&report.manifest_name).is_file());

    let decryptor = Decryptor::new(symmetric_keys(&keyfile), sink(), true);
    let restored = decryptor
        .decrypt(&[report.manifest_name.clone()])
        .await
        .unwrap();
    std::env::set_current_dir(prev).unwrap();

    assert!(restored.ok(), "{:?}", restored.failures);
    assert_eq!(std::fs::read(work.join("payload.bin")).unwrap(), b"consume me");
    assert!(!work.join(&blob_name).exists(), "blob not consumed");
    assert!(
        !work.join(&report.manifest_name).exists(),
        "manifest not consumed"
    );
}
