//! Persistent file system tests
//!
//! Each test reopens a tree document and a Fjall cache from its own
//! temporary directory.

use semfs_core::{
    props, CancellationToken, DefaultContentProvider, FileSystemConfig, ProviderRegistry,
    QualifiedName, ResourceKind, SemanticFileSystem, SemanticStore,
};
use std::io::{Read, Write};
use std::sync::Arc;
use tempfile::TempDir;

fn registry() -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::new().with("default", |id| Ok(DefaultContentProvider::shared(id))))
}

fn write(store: &SemanticStore, content: &[u8]) {
    let mut out = store
        .open_output_stream(false, &CancellationToken::new())
        .unwrap();
    out.write_all(content).unwrap();
    out.flush().unwrap();
}

fn read(store: &SemanticStore) -> String {
    let mut content = String::new();
    store
        .open_input_stream(&CancellationToken::new())
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    content
}

#[test]
fn test_tree_and_content_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = FileSystemConfig::persistent(dir.path());
    let session_key = QualifiedName::new("test", "session").unwrap();

    {
        let fs = SemanticFileSystem::open(config.clone(), registry()).unwrap();
        let proj = fs.add_root("proj", Some("http://example.com/proj")).unwrap();
        let docs = proj.get_child("docs").unwrap().mkdir(false).unwrap();
        let notes = docs.add_child_file("notes.txt", None, None).unwrap();
        write(&notes, b"persisted");
        notes
            .set_persistent_property(&props::key(props::REMOTE_URI), Some("http://example.com/notes"))
            .unwrap();
        notes.set_session_property(&session_key, Some(Arc::new(1u8))).unwrap();
        fs.flush().unwrap();
    }

    let fs = SemanticFileSystem::open(config, registry()).unwrap();
    assert_eq!(fs.root_names().unwrap(), vec!["proj".to_string()]);

    let notes = fs.get_store("semfs:/proj/docs/notes.txt").unwrap();
    assert!(notes.exists().unwrap());
    assert_eq!(notes.kind().unwrap(), ResourceKind::File);
    assert_eq!(read(&notes), "persisted");
    assert_eq!(
        notes.remote_uri().unwrap().as_deref(),
        Some("http://example.com/notes")
    );
    assert!(notes.session_property(&session_key).unwrap().is_none());
    assert_eq!(
        fs.locate("http://example.com/notes", None).unwrap(),
        vec!["/proj/docs/notes.txt".to_string()]
    );
}

#[test]
fn test_content_follows_renamed_root() {
    let dir = TempDir::new().unwrap();
    let config = FileSystemConfig::persistent(dir.path());

    {
        let fs = SemanticFileSystem::open(config.clone(), registry()).unwrap();
        let proj = fs.add_root("before", None).unwrap();
        let file = proj.add_child_file("f.txt", None, None).unwrap();
        write(&file, b"kept");
        fs.rename_root("before", "after").unwrap();
        assert_eq!(read(&file), "kept");
        fs.flush().unwrap();
    }

    let fs = SemanticFileSystem::open(config, registry()).unwrap();
    assert_eq!(fs.root_names().unwrap(), vec!["after".to_string()]);
    let file = fs.get_store("/after/f.txt").unwrap();
    assert_eq!(read(&file), "kept");
}

#[test]
fn test_manual_flush_mode() {
    let dir = TempDir::new().unwrap();
    let mut config = FileSystemConfig::persistent(dir.path());
    config.auto_flush = false;

    {
        let fs = SemanticFileSystem::open(config.clone(), registry()).unwrap();
        fs.add_root("unsaved", None).unwrap();
        assert!(fs.is_dirty());
    }
    {
        let fs = SemanticFileSystem::open(config.clone(), registry()).unwrap();
        assert!(fs.root_names().unwrap().is_empty());
        fs.add_root("saved", None).unwrap();
        fs.flush().unwrap();
        assert!(!fs.is_dirty());
    }

    let fs = SemanticFileSystem::open(config, registry()).unwrap();
    assert_eq!(fs.root_names().unwrap(), vec!["saved".to_string()]);
}

#[test]
fn test_local_file_is_spooled_below_local_dir() {
    let dir = TempDir::new().unwrap();
    let fs = SemanticFileSystem::open(FileSystemConfig::persistent(dir.path()), registry()).unwrap();
    let proj = fs.add_root("proj", None).unwrap();
    let file = proj
        .get_child("docs")
        .unwrap()
        .mkdir(false)
        .unwrap()
        .add_child_file("a.txt", None, None)
        .unwrap();
    write(&file, b"on disk");

    let local = file.to_local_file(&CancellationToken::new()).unwrap();
    assert_eq!(local, dir.path().join("local").join("proj/docs/a.txt"));
    assert_eq!(std::fs::read(&local).unwrap(), b"on disk");
}

#[test]
fn test_removed_root_stays_removed() {
    let dir = TempDir::new().unwrap();
    let config = FileSystemConfig::persistent(dir.path());

    {
        let fs = SemanticFileSystem::open(config.clone(), registry()).unwrap();
        let proj = fs.add_root("gone", None).unwrap();
        write(&proj.add_child_file("f", None, None).unwrap(), b"x");
        fs.remove_root("gone", &CancellationToken::new()).unwrap();
    }

    let fs = SemanticFileSystem::open(config, registry()).unwrap();
    assert!(fs.root("gone").is_err());
    assert!(fs.get_store("/gone/f").is_err());
}
