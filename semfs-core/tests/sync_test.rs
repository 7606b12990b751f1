//! Synchronization tests against an in-memory remote repository

use bytes::Bytes;
use semfs_core::{
    CancellationToken, DefaultContentProvider, MemoryRemoteStore, MultiStatus, ProviderRegistry,
    RemoteStoreProvider, SemanticFileSystem, SemanticStore, Severity, SyncDirection,
};
use std::io::{Read, Write};
use std::sync::Arc;

struct Fixture {
    _fs: SemanticFileSystem,
    remote: Arc<MemoryRemoteStore>,
    mirror: SemanticStore,
}

fn fixture() -> Fixture {
    let remote = MemoryRemoteStore::shared();
    let registry = ProviderRegistry::new()
        .with("default", |id| Ok(DefaultContentProvider::shared(id)))
        .with("remote-store", RemoteStoreProvider::factory(remote.clone()));
    let fs = SemanticFileSystem::in_memory(Arc::new(registry)).unwrap();
    let proj = fs.add_root("proj", None).unwrap();
    let mirror = proj.add_child_folder("mirror", Some("remote-store")).unwrap();
    Fixture { _fs: fs, remote, mirror }
}

fn write(store: &SemanticStore, content: &[u8]) {
    let mut out = store
        .open_output_stream(false, &CancellationToken::new())
        .unwrap();
    out.write_all(content).unwrap();
    out.flush().unwrap();
}

fn read(store: &SemanticStore) -> Vec<u8> {
    let mut content = Vec::new();
    store
        .open_input_stream(&CancellationToken::new())
        .unwrap()
        .read_to_end(&mut content)
        .unwrap();
    content
}

fn sync(store: &SemanticStore, direction: SyncDirection) -> MultiStatus {
    let mut status = MultiStatus::new();
    store.synchronize_content_with_remote(direction, &mut status, &CancellationToken::new());
    status
}

fn names(store: &SemanticStore) -> Vec<String> {
    store.child_names().unwrap()
}

#[test]
fn test_outgoing_then_incoming_round_trip() {
    let f = fixture();
    f.remote
        .put_file("doc.txt", Bytes::from_static(b"old"), 1_000, None)
        .unwrap();
    let doc = f.mirror.add_child_file("doc.txt", None, None).unwrap();
    write(&doc, b"A");

    let status = sync(&doc, SyncDirection::Outgoing);
    assert!(status.is_ok(), "{:?}", status.entries());
    assert_eq!(f.remote.get_file("doc.txt").unwrap().content, Bytes::from_static(b"A"));

    let newer = doc.last_modified(&CancellationToken::new()).unwrap().unwrap() + 10_000;
    f.remote
        .put_file("doc.txt", Bytes::from_static(b"B"), newer, None)
        .unwrap();

    let status = sync(&doc, SyncDirection::Incoming);
    assert!(status.is_ok(), "{:?}", status.entries());
    assert_eq!(read(&doc), b"B");
    assert_eq!(doc.last_modified(&CancellationToken::new()).unwrap(), Some(newer));
}

#[test]
fn test_both_picks_changed_side() {
    let f = fixture();
    f.remote
        .put_file("f.txt", Bytes::from_static(b"remote-1"), 100, None)
        .unwrap();
    let file = f.mirror.add_file_from_remote("f.txt", &CancellationToken::new()).unwrap();

    // Nothing local yet: download
    assert!(sync(&file, SyncDirection::Both).is_ok());
    assert_eq!(read(&file), b"remote-1");

    // Local edit, remote unchanged: upload
    write(&file, b"local-2");
    assert!(sync(&file, SyncDirection::Both).is_ok());
    assert_eq!(f.remote.get_file("f.txt").unwrap().content, Bytes::from_static(b"local-2"));

    // Unchanged on both sides: nothing moves
    let before = f.remote.get_file("f.txt").unwrap();
    assert!(sync(&file, SyncDirection::Both).is_ok());
    let after = f.remote.get_file("f.txt").unwrap();
    assert_eq!(before.timestamp, after.timestamp);
    assert_eq!(before.etag, after.etag);

    // Remote edit: download
    f.remote
        .put_file("f.txt", Bytes::from_static(b"remote-3"), after.timestamp + 1, None)
        .unwrap();
    assert!(sync(&file, SyncDirection::Both).is_ok());
    assert_eq!(read(&file), b"remote-3");
}

#[test]
fn test_folder_sync_adds_remote_children() {
    let f = fixture();
    f.remote.put_file("a.txt", Bytes::from_static(b"a"), 10, None).unwrap();
    f.remote.put_file("sub/b.txt", Bytes::from_static(b"b"), 20, None).unwrap();

    let status = sync(&f.mirror, SyncDirection::Both);
    assert!(status.is_ok(), "{:?}", status.entries());

    assert_eq!(names(&f.mirror), vec!["a.txt".to_string(), "sub".to_string()]);
    let a = f.mirror.get_child("a.txt").unwrap();
    assert_eq!(read(&a), b"a");
    assert!(a.is_read_only(&CancellationToken::new()).unwrap());

    let b = f.mirror.get_child("sub").unwrap().get_child("b.txt").unwrap();
    assert!(b.exists().unwrap());
    assert_eq!(read(&b), b"b");
}

#[test]
fn test_folder_sync_removes_only_unchanged_resources() {
    let f = fixture();
    f.remote.put_file("a.txt", Bytes::from_static(b"a"), 10, None).unwrap();
    f.remote.put_file("sub/b.txt", Bytes::from_static(b"b"), 20, None).unwrap();
    assert!(sync(&f.mirror, SyncDirection::Both).is_ok());

    let local = f.mirror.add_child_file("local.txt", None, None).unwrap();
    write(&local, b"mine");
    let b = f.mirror.get_child("sub").unwrap().get_child("b.txt").unwrap();
    write(&b, b"edited");

    f.remote.delete("a.txt").unwrap();
    f.remote.delete("sub").unwrap();
    let status = sync(&f.mirror, SyncDirection::Both);
    assert!(status.is_ok(), "{:?}", status.entries());

    // a.txt was unchanged and is gone; the rest carried local changes
    assert_eq!(names(&f.mirror), vec!["local.txt".to_string(), "sub".to_string()]);
    assert_eq!(f.remote.get_file("local.txt").unwrap().content, Bytes::from_static(b"mine"));
    assert_eq!(f.remote.get_file("sub/b.txt").unwrap().content, Bytes::from_static(b"edited"));
}

#[test]
fn test_incoming_never_uploads() {
    let f = fixture();
    let local = f.mirror.add_child_file("only-here.txt", None, None).unwrap();
    write(&local, b"x");

    assert!(sync(&f.mirror, SyncDirection::Incoming).is_ok());
    assert!(!f.remote.contains("only-here.txt"));
    // Local-only content survives a listing that does not mention it
    assert_eq!(names(&f.mirror), vec!["only-here.txt".to_string()]);
}

#[test]
fn test_cancelled_sync_reports_cancel() {
    let f = fixture();
    f.remote.put_file("a.txt", Bytes::from_static(b"a"), 10, None).unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let mut status = MultiStatus::new();
    f.mirror
        .synchronize_content_with_remote(SyncDirection::Both, &mut status, &token);
    assert_eq!(status.severity(), Severity::Cancel);
    assert!(names(&f.mirror).is_empty());
}

#[test]
fn test_validate_edit_takes_remote_lock() {
    let f = fixture();
    let token = CancellationToken::new();
    f.remote.put_file("a.txt", Bytes::from_static(b"a"), 10, None).unwrap();
    assert!(sync(&f.mirror, SyncDirection::Both).is_ok());
    let a = f.mirror.get_child("a.txt").unwrap();
    assert!(a.is_read_only(&token).unwrap());

    let status = a.validate_edit();
    assert!(status.is_ok(), "{}", status);
    assert!(!a.is_read_only(&token).unwrap());
    assert!(f.remote.get_file("a.txt").unwrap().lock_token.is_some());

    // Other writers are locked out, the lock holder is not
    assert!(f.remote.put_file("a.txt", Bytes::from_static(b"other"), 99, None).is_err());
    write(&a, b"a2");
    assert!(sync(&a, SyncDirection::Outgoing).is_ok());
    assert_eq!(f.remote.get_file("a.txt").unwrap().content, Bytes::from_static(b"a2"));

    assert!(a.unlock_resource(&token).is_ok());
    assert!(f.remote.get_file("a.txt").unwrap().lock_token.is_none());
    assert!(a.unlock_resource(&token).is_acceptable());
}

#[test]
fn test_validate_remote_delete_sees_foreign_lock() {
    let f = fixture();
    f.remote.put_file("x", Bytes::from_static(b"x"), 10, None).unwrap();
    let x = f.mirror.add_file_from_remote("x", &CancellationToken::new()).unwrap();
    assert!(x.validate_remote_delete().is_ok());

    f.remote.lock("x").unwrap();
    assert!(!x.validate_remote_delete().is_acceptable());
}

#[test]
fn test_create_and_delete_remotely() {
    let f = fixture();
    let token = CancellationToken::new();
    let created = f
        .mirror
        .create_file_remotely("new.txt", Some(Bytes::from_static(b"n")), None, &token)
        .unwrap();
    assert_eq!(read(&created), b"n");
    assert_eq!(f.remote.get_file("new.txt").unwrap().content, Bytes::from_static(b"n"));
    assert!(!f.mirror.validate_remote_create("new.txt").is_acceptable());
    assert!(f.mirror.validate_remote_create("other.txt").is_ok());

    let folder = f.mirror.create_resource_remotely("docs", None, &token).unwrap();
    assert!(f.remote.list("docs").is_some());
    assert!(folder.exists().unwrap());

    created.remove(false, &token).unwrap();
    assert!(!f.remote.contains("new.txt"));
    assert_eq!(names(&f.mirror), vec!["docs".to_string()]);
}

#[test]
fn test_revert_changes_restores_remote_content() {
    let f = fixture();
    let token = CancellationToken::new();
    f.remote.put_file("r.txt", Bytes::from_static(b"remote"), 10, None).unwrap();
    assert!(sync(&f.mirror, SyncDirection::Incoming).is_ok());
    let r = f.mirror.get_child("r.txt").unwrap();

    write(&r, b"scratch");
    r.revert_changes(&token).unwrap();
    assert_eq!(read(&r), b"remote");
}

#[test]
fn test_edit_right_after_remote_create_is_uploaded() {
    let f = fixture();
    let token = CancellationToken::new();
    for i in 0..20 {
        let name = format!("quick-{}.txt", i);
        let file = f
            .mirror
            .create_file_remotely(&name, Some(Bytes::from_static(b"A")), None, &token)
            .unwrap();
        write(&file, b"B");

        let status = sync(&file, SyncDirection::Both);
        assert!(status.is_ok(), "{:?}", status.entries());
        assert_eq!(f.remote.get_file(&name).unwrap().content, Bytes::from_static(b"B"));
    }
}

#[test]
fn test_edit_right_after_upload_is_uploaded() {
    let f = fixture();
    let file = f.mirror.add_child_file("u.txt", None, None).unwrap();
    for round in 0..20u8 {
        write(&file, &[b'a' + round]);
        let status = sync(&file, SyncDirection::Both);
        assert!(status.is_ok(), "{:?}", status.entries());
        assert_eq!(f.remote.get_file("u.txt").unwrap().content, Bytes::from(vec![b'a' + round]));
    }
}

#[test]
fn test_fresh_edit_survives_remote_deletion() {
    let f = fixture();
    let token = CancellationToken::new();
    let file = f
        .mirror
        .create_file_remotely("kept.txt", Some(Bytes::from_static(b"A")), None, &token)
        .unwrap();
    write(&file, b"B");
    f.remote.delete("kept.txt").unwrap();

    assert!(sync(&f.mirror, SyncDirection::Both).is_ok());
    assert_eq!(names(&f.mirror), vec!["kept.txt".to_string()]);
    assert_eq!(f.remote.get_file("kept.txt").unwrap().content, Bytes::from_static(b"B"));
}

#[test]
fn test_failing_child_does_not_stop_siblings() {
    let f = fixture();
    f.remote.put_file("old.txt", Bytes::from_static(b"o"), 10, None).unwrap();
    assert!(sync(&f.mirror, SyncDirection::Both).is_ok());

    f.remote.delete("old.txt").unwrap();
    f.remote.put_file("..", Bytes::from_static(b"x"), 20, None).unwrap();
    f.remote.put_file("new.txt", Bytes::from_static(b"n"), 30, None).unwrap();

    let status = sync(&f.mirror, SyncDirection::Both);
    let errors: Vec<_> = status.errors().collect();
    assert_eq!(errors.len(), 1, "{:?}", status.entries());
    assert_eq!(errors[0].path.as_deref(), Some("/proj/mirror/.."));

    // The bad name is reported, its siblings are still reconciled
    assert_eq!(names(&f.mirror), vec!["new.txt".to_string()]);
    assert_eq!(read(&f.mirror.get_child("new.txt").unwrap()), b"n");
}
