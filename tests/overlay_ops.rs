mod common;

use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use common::Harness;
use stratafs::overlay::direntry::{DirEntry, DirentSink};
use stratafs::overlay::ident::ROOT_ID;

const ROOT: u64 = 1;
const PID: u32 = 1000;

struct CollectSink {
    names: Vec<String>,
}

impl DirentSink for CollectSink {
    fn push(&mut self, entry: &DirEntry) -> bool {
        self.names.push(entry.name.to_string_lossy().into_owned());
        false
    }
}

fn read_names(h: &Harness) -> Vec<String> {
    let fh = h.fs.do_opendir(ROOT, PID).unwrap();
    let mut sink = CollectSink { names: vec![] };
    h.fs.do_readdir(fh, 0, &mut sink).unwrap();
    h.fs.do_release(fh);
    sink.names
}

#[test]
fn test_lookup_rejects_long_names() {
    let Some(h) = Harness::new() else { return };
    let long = "x".repeat(300);
    assert_eq!(
        h.fs.do_lookup(ROOT, OsStr::new(&long)),
        Err(libc::ENAMETOOLONG)
    );
}

#[test]
fn test_lookup_resolves_lower_layer_entries() {
    let Some(h) = Harness::new() else { return };
    let id = h.seed_lower_file(&ROOT_ID, "a", b"alpha");

    let attr = h.fs.do_lookup(ROOT, OsStr::new("a")).unwrap();
    assert_eq!(attr.ino, id.to_ino());
    assert_eq!(attr.size, 5);

    assert_eq!(
        h.fs.do_lookup(ROOT, OsStr::new("missing")),
        Err(libc::ENOENT)
    );
}

#[test]
fn test_masking_after_unlink_and_create() {
    let Some(h) = Harness::new() else { return };
    let a1 = h.seed_lower_file(&ROOT_ID, "a", b"deep");

    let attr = h.fs.do_lookup(ROOT, OsStr::new("a")).unwrap();
    assert_eq!(attr.ino, a1.to_ino());

    h.fs.do_unlink(ROOT, OsStr::new("a")).unwrap();
    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("a")), Err(libc::ENOENT));

    // The deletion left a whiteout at the top-layer child path.
    let entry = h.upper_entry(&ROOT_ID, "a");
    assert!(h.fs.store().is_deleted(&entry));

    // Re-creating the name consumes the whiteout and mints a new object.
    let (attr2, fh, _) =
        h.fs.do_create(ROOT, OsStr::new("a"), 0o644, libc::O_RDWR, 0, 0, PID).unwrap();
    h.fs.do_release(fh);
    assert_ne!(attr2.ino, a1.to_ino());
    assert!(!h.fs.store().is_deleted(&entry));

    let relooked = h.fs.do_lookup(ROOT, OsStr::new("a")).unwrap();
    assert_eq!(relooked.ino, attr2.ino);
}

#[test]
fn test_write_triggers_copy_up() {
    let Some(h) = Harness::new() else { return };
    let id = h.seed_lower_file(&ROOT_ID, "f", b"hello");

    let attr = h.fs.do_lookup(ROOT, OsStr::new("f")).unwrap();
    let (fh, _) = h.fs.do_open(attr.ino, libc::O_RDWR, PID).unwrap();

    let written = h.fs.do_write(attr.ino, fh, 5, b" world").unwrap();
    assert_eq!(written, 6);

    // The object now lives on the top layer; the bottom copy is intact.
    assert_eq!(fs::read(h.upper_object(&id)).unwrap(), b"hello world");
    assert_eq!(fs::read(h.lower_object(&id)).unwrap(), b"hello");

    // The descriptor was re-plumbed onto the top layer copy.
    let data = h.fs.do_read(attr.ino, fh, 0, 64).unwrap();
    assert_eq!(data, b"hello world");
    h.fs.do_release(fh);
}

#[test]
fn test_read_on_stale_descriptor_follows_copy_up() {
    let Some(h) = Harness::new() else { return };
    let id = h.seed_lower_file(&ROOT_ID, "f", b"original");

    let attr = h.fs.do_lookup(ROOT, OsStr::new("f")).unwrap();
    let reader = h.fs.do_open(attr.ino, libc::O_RDONLY, PID).unwrap().0;
    let writer = h.fs.do_open(attr.ino, libc::O_RDWR, PID).unwrap().0;

    // Another descriptor forces the copy-up...
    h.fs.do_write(attr.ino, writer, 0, b"rewritten").unwrap();
    assert_eq!(fs::read(h.upper_object(&id)).unwrap(), b"rewritten");

    // ...and the read-only descriptor reopens onto layer 0 before I/O.
    let data = h.fs.do_read(attr.ino, reader, 0, 64).unwrap();
    assert_eq!(data, b"rewritten");

    h.fs.do_release(reader);
    h.fs.do_release(writer);
}

#[test]
fn test_link_and_unlink_accounting() {
    let Some(h) = Harness::new() else { return };
    let (attr, fh, _) =
        h.fs.do_create(ROOT, OsStr::new("x"), 0o644, libc::O_RDWR, 0, 0, PID).unwrap();
    h.fs.do_release(fh);
    let id = h.fs.store().child_id(&ROOT_ID, OsStr::new("x"), None).unwrap();

    let linked = h.fs.do_link(attr.ino, ROOT, OsStr::new("y")).unwrap();
    assert_eq!(linked.ino, attr.ino);
    assert_eq!(linked.nlink, 2);

    h.fs.do_unlink(ROOT, OsStr::new("x")).unwrap();
    assert!(h.upper_object(&id).exists());
    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("y")).unwrap().nlink, 1);

    h.fs.do_unlink(ROOT, OsStr::new("y")).unwrap();
    assert!(!h.upper_object(&id).exists());
    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("x")), Err(libc::ENOENT));
    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("y")), Err(libc::ENOENT));
}

#[test]
fn test_rmdir_refuses_when_merge_sees_deeper_children() {
    let Some(h) = Harness::new() else { return };
    let dir_id = h.seed_lower_dir(&ROOT_ID, "d");
    let entry = h.lower_object(&dir_id).join("file");
    fs::write(&entry, b"").unwrap();
    xattr::set(
        &entry,
        stratafs::overlay::store::ID_XATTR,
        stratafs::overlay::ident::ObjectId::new_v4().hex().as_bytes(),
    )
    .unwrap();
    // An empty top-layer copy of the directory does not hide the child.
    h.seed_upper_dir_object(&dir_id);

    h.fs.do_lookup(ROOT, OsStr::new("d")).unwrap();
    assert_eq!(h.fs.do_rmdir(ROOT, OsStr::new("d")), Err(libc::ENOTEMPTY));
}

#[test]
fn test_rmdir_of_lower_directory_leaves_whiteout() {
    let Some(h) = Harness::new() else { return };
    h.seed_lower_dir(&ROOT_ID, "empty");

    h.fs.do_lookup(ROOT, OsStr::new("empty")).unwrap();
    h.fs.do_rmdir(ROOT, OsStr::new("empty")).unwrap();

    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("empty")), Err(libc::ENOENT));
    assert!(h.fs.store().is_deleted(&h.upper_entry(&ROOT_ID, "empty")));
}

#[test]
fn test_rename_preserves_identity_for_open_descriptors() {
    let Some(h) = Harness::new() else { return };
    let (attr, fh, _) =
        h.fs.do_create(ROOT, OsStr::new("a"), 0o644, libc::O_RDWR, 0, 0, PID).unwrap();
    h.fs.do_write(attr.ino, fh, 0, b"payload").unwrap();

    h.fs.do_rename(ROOT, OsStr::new("a"), ROOT, OsStr::new("b")).unwrap();

    // The open descriptor still reaches the same object bytes.
    assert_eq!(h.fs.do_read(attr.ino, fh, 0, 64).unwrap(), b"payload");
    h.fs.do_release(fh);

    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("b")).unwrap().ino, attr.ino);
    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("a")), Err(libc::ENOENT));
}

#[test]
fn test_rename_replaces_existing_destination() {
    let Some(h) = Harness::new() else { return };
    let (x_attr, x_fh, _) =
        h.fs.do_create(ROOT, OsStr::new("x"), 0o644, libc::O_RDWR, 0, 0, PID).unwrap();
    h.fs.do_release(x_fh);
    let (_y_attr, y_fh, _) =
        h.fs.do_create(ROOT, OsStr::new("y"), 0o644, libc::O_RDWR, 0, 0, PID).unwrap();
    h.fs.do_release(y_fh);
    let y_id = h.fs.store().child_id(&ROOT_ID, OsStr::new("y"), None).unwrap();

    let invalidate =
        h.fs.do_rename(ROOT, OsStr::new("x"), ROOT, OsStr::new("y")).unwrap();
    assert_eq!(invalidate.len(), 2);

    // The replaced object's backing is gone; the name resolves to x now.
    assert!(!h.upper_object(&y_id).exists());
    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("y")).unwrap().ino, x_attr.ino);
    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("x")), Err(libc::ENOENT));
}

#[test]
fn test_rename_of_lower_object_whiteouts_source() {
    let Some(h) = Harness::new() else { return };
    let id = h.seed_lower_file(&ROOT_ID, "old", b"body");

    h.fs.do_lookup(ROOT, OsStr::new("old")).unwrap();
    h.fs.do_rename(ROOT, OsStr::new("old"), ROOT, OsStr::new("new")).unwrap();

    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("old")), Err(libc::ENOENT));
    assert!(h.fs.store().is_deleted(&h.upper_entry(&ROOT_ID, "old")));

    // Identity travelled with the entry; content is still served from
    // the bottom-layer backing object.
    let attr = h.fs.do_lookup(ROOT, OsStr::new("new")).unwrap();
    assert_eq!(attr.ino, id.to_ino());
    assert_eq!(attr.size, 4);
}

#[test]
fn test_whiteout_survives_remount() {
    let Some(mut h) = Harness::new() else { return };
    h.seed_lower_file(&ROOT_ID, "g", b"gone");

    h.fs.do_lookup(ROOT, OsStr::new("g")).unwrap();
    h.fs.do_unlink(ROOT, OsStr::new("g")).unwrap();

    h.remount();
    assert_eq!(h.fs.do_lookup(ROOT, OsStr::new("g")), Err(libc::ENOENT));
    assert!(!read_names(&h).iter().any(|n| n == "g"));
}

#[test]
fn test_readdir_merges_layers_and_appends_dot() {
    let Some(h) = Harness::new() else { return };
    h.seed_lower_file(&ROOT_ID, "deep", b"");
    let (_, fh, _) =
        h.fs.do_create(ROOT, OsStr::new("shallow"), 0o644, libc::O_RDWR, 0, 0, PID).unwrap();
    h.fs.do_release(fh);

    assert_eq!(read_names(&h), vec!["deep", "shallow", "."]);

    // Listing again with no mutation yields the same names.
    assert_eq!(read_names(&h), vec!["deep", "shallow", "."]);
}

#[test]
fn test_readdir_streams_from_offset() {
    let Some(h) = Harness::new() else { return };
    for name in ["a", "b", "c"] {
        h.seed_lower_file(&ROOT_ID, name, b"");
    }
    let fh = h.fs.do_opendir(ROOT, PID).unwrap();
    let mut sink = CollectSink { names: vec![] };
    h.fs.do_readdir(fh, 2, &mut sink).unwrap();
    assert_eq!(sink.names, vec!["c", "."]);

    let mut sink = CollectSink { names: vec![] };
    assert_eq!(h.fs.do_readdir(fh, 99, &mut sink), Err(libc::EINVAL));
    h.fs.do_release(fh);
}

#[test]
fn test_symlink_and_readlink() {
    let Some(h) = Harness::new() else { return };
    let attr =
        h.fs.do_symlink(ROOT, OsStr::new("s"), Path::new("over/there"), 0, 0).unwrap();
    assert_eq!(attr.kind, fuser::FileType::Symlink);

    let target = h.fs.do_readlink(attr.ino).unwrap();
    assert_eq!(target, b"over/there");
}

#[test]
fn test_setattr_truncate_by_path_copies_up() {
    let Some(h) = Harness::new() else { return };
    let id = h.seed_lower_file(&ROOT_ID, "t", b"0123456789");

    let attr = h.fs.do_lookup(ROOT, OsStr::new("t")).unwrap();
    let out =
        h.fs.do_setattr(attr.ino, None, None, None, Some(4), None, None, None).unwrap();

    assert_eq!(out.size, 4);
    assert_eq!(out.ino, id.to_ino());
    assert_eq!(fs::read(h.upper_object(&id)).unwrap(), b"0123");
    assert_eq!(fs::read(h.lower_object(&id)).unwrap(), b"0123456789");
}

#[test]
fn test_setattr_truncate_through_descriptor_replumbs() {
    let Some(h) = Harness::new() else { return };
    let id = h.seed_lower_file(&ROOT_ID, "t", b"0123456789");

    let attr = h.fs.do_lookup(ROOT, OsStr::new("t")).unwrap();
    let (fh, _) = h.fs.do_open(attr.ino, libc::O_RDWR, PID).unwrap();

    let out = h
        .fs
        .do_setattr(attr.ino, None, None, None, Some(3), None, None, Some(fh))
        .unwrap();
    assert_eq!(out.size, 3);
    assert_eq!(fs::read(h.upper_object(&id)).unwrap(), b"012");
    assert_eq!(fs::read(h.lower_object(&id)).unwrap(), b"0123456789");

    // The same descriptor keeps working against the top-layer copy.
    assert_eq!(h.fs.do_read(attr.ino, fh, 0, 64).unwrap(), b"012");
    h.fs.do_release(fh);
}

#[test]
fn test_getattr_prefers_open_descriptor_of_caller() {
    let Some(h) = Harness::new() else { return };
    let (attr, fh, _) =
        h.fs.do_create(ROOT, OsStr::new("g"), 0o600, libc::O_RDWR, 0, 0, 777).unwrap();
    h.fs.do_write(attr.ino, fh, 0, b"12345").unwrap();

    let from_fd = h.fs.do_getattr(attr.ino, 777).unwrap();
    assert_eq!(from_fd.size, 5);
    assert_eq!(from_fd.ino, attr.ino);

    // Another process without an open handle sees the same through lstat.
    let from_path = h.fs.do_getattr(attr.ino, 42).unwrap();
    assert_eq!(from_path.size, 5);
    h.fs.do_release(fh);
}

#[test]
fn test_mkdir_create_inside_subdirectory() {
    let Some(h) = Harness::new() else { return };
    let dir_attr = h.fs.do_mkdir(ROOT, OsStr::new("sub"), 0o755, 0, 0).unwrap();
    assert_eq!(dir_attr.kind, fuser::FileType::Directory);

    let (file_attr, fh, _) = h
        .fs
        .do_create(dir_attr.ino, OsStr::new("inner"), 0o644, libc::O_RDWR, 0, 0, PID)
        .unwrap();
    h.fs.do_write(file_attr.ino, fh, 0, b"abc").unwrap();
    h.fs.do_release(fh);

    let looked = h.fs.do_lookup(dir_attr.ino, OsStr::new("inner")).unwrap();
    assert_eq!(looked.ino, file_attr.ino);
    assert_eq!(looked.size, 3);

    // Unlink inside the subdirectory leaves no whiteout: nothing deeper
    // resolves the name.
    h.fs.do_unlink(dir_attr.ino, OsStr::new("inner")).unwrap();
    assert_eq!(
        h.fs.do_lookup(dir_attr.ino, OsStr::new("inner")),
        Err(libc::ENOENT)
    );
    let dir_id = h.fs.store().child_id(&ROOT_ID, OsStr::new("sub"), None).unwrap();
    assert!(!h.fs.store().is_deleted(&h.upper_object(&dir_id).join("inner")));
}

#[test]
fn test_forget_drops_record_and_lookup_rebuilds_it() {
    let Some(h) = Harness::new() else { return };
    h.seed_lower_file(&ROOT_ID, "f", b"x");

    let attr = h.fs.do_lookup(ROOT, OsStr::new("f")).unwrap();
    h.fs.do_forget(attr.ino, 1);

    // The record is gone, so fd-less getattr has nothing to go on...
    assert_eq!(h.fs.do_getattr(attr.ino, PID), Err(libc::ENOENT));

    // ...but a fresh lookup re-installs it.
    let again = h.fs.do_lookup(ROOT, OsStr::new("f")).unwrap();
    assert_eq!(again.ino, attr.ino);
}
