use std::fs;
use std::io::Write;
use tempfile::TempDir;

use recall_core::chunker::Chunker;
use recall_core::loader::DocumentLoader;

#[test]
fn load_dir_single_small_file() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    let file_path = dir.join("a.txt");
    let mut f = fs::File::create(&file_path).unwrap();
    writeln!(f, "Short text").unwrap();

    let docs = DocumentLoader::new().load_dir(dir).expect("load");

    assert_eq!(docs.len(), 1, "one small file becomes one document");
    assert_eq!(docs[0].source_id, "a.txt");
    assert_eq!(docs[0].text.trim(), "Short text");

    let chunker = Chunker::with_sizes(800, 100).unwrap();
    assert_eq!(chunker.chunk(&docs[0]).count(), 1, "short document is one chunk");
}

#[test]
fn load_dir_limited_two_files_limit_one() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(dir.join("a.txt"), "alpha bravo").unwrap();
    fs::write(dir.join("b.md"), "charlie delta").unwrap();

    let docs = DocumentLoader::new().with_limit(1).load_dir(dir).expect("load limited");

    assert_eq!(docs.len(), 1, "limited to one source document");
    assert_eq!(docs[0].source_id, "a.txt");
}

#[test]
fn nested_files_use_relative_ids_and_skip_other_extensions() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::create_dir_all(dir.join("garden/pests")).unwrap();
    fs::write(dir.join("garden/pests/aphids.md"), "# Aphids\nGarlic spray.").unwrap();
    fs::write(dir.join("garden/photo.png"), [0u8, 1, 2]).unwrap();

    let docs = DocumentLoader::new().load_dir(dir).expect("load");

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].source_id, "garden/pests/aphids.md");
}

#[test]
fn unreadable_file_is_skipped_and_the_rest_load() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(dir.join("a.md"), "alpha").unwrap();
    fs::write(dir.join("b.md"), "bravo").unwrap();
    fs::write(dir.join("c.md"), "charlie").unwrap();

    let loader = DocumentLoader::new();
    let files = loader.list_files(dir);
    assert_eq!(files.len(), 3);
    // Deleted between the directory walk and the read.
    fs::remove_file(dir.join("b.md")).unwrap();

    let docs = loader.load_files(dir, &files);
    let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
    assert_eq!(ids, vec!["a.md", "c.md"]);
}

#[cfg(unix)]
#[test]
fn load_dir_survives_a_file_it_cannot_read() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(dir.join("open.md"), "readable").unwrap();
    let locked = dir.join("locked.md");
    fs::write(&locked, "secret").unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

    let docs = DocumentLoader::new().load_dir(dir).expect("load");

    // Privileged users can still read the locked file.
    let readable = fs::read(&locked).is_ok();
    let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
    if readable {
        assert_eq!(ids, vec!["locked.md", "open.md"]);
    } else {
        assert_eq!(ids, vec!["open.md"]);
    }
}

#[test]
fn invalid_utf8_is_decoded_lossily() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bad.txt");
    fs::write(&path, [b'o', b'k', 0xff, b'!']).unwrap();

    let doc = DocumentLoader::new().load_file(tmp.path(), &path).expect("lossy load");

    assert!(doc.text.starts_with("ok"));
    assert!(doc.text.ends_with('!'));
}

#[test]
fn empty_directory_yields_no_documents() {
    let tmp = TempDir::new().unwrap();
    let docs = DocumentLoader::new().load_dir(tmp.path()).expect("load");
    assert!(docs.is_empty());
}
