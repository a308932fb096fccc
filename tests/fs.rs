//! File-system integration tests.
//!
//! Most tests drive an owned `FileSystem` on a scratch disk image; one
//! test exercises the flat process-global API end to end.

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use ulsys::{FileSystem, FsError, BLOCK_SIZE, NFD};

const MIB: usize = 1024 * 1024;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn image(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn fresh(path: &Path) -> FileSystem {
    FileSystem::format(path).unwrap();
    FileSystem::mount(path).unwrap()
}

/// 'A'..'Z' repeating, the classic persistence payload.
fn alphabet(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'A' + (i % 26) as u8).collect()
}

#[test]
fn persistence_across_remount() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let payload = alphabet(1024);

    let mut fs = fresh(&path);
    fs.create("journal").unwrap();
    let fd = fs.open("journal").unwrap();
    assert_eq!(fs.write(fd, &payload).unwrap(), payload.len());
    fs.close(fd).unwrap();
    fs.unmount().unwrap();

    let mut fs = FileSystem::mount(&path).unwrap();
    let fd = fs.open("journal").unwrap();
    assert_eq!(fs.filesize(fd).unwrap(), payload.len());
    let mut back = vec![0u8; payload.len()];
    assert_eq!(fs.read(fd, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);
    fs.unmount().unwrap();
}

#[test]
fn size_is_exactly_what_was_written() {
    let dir = TempDir::new().unwrap();
    for (i, n) in [0usize, 8000, MIB].into_iter().enumerate() {
        let path = image(&dir, &format!("disk{i}.img"));
        let mut fs = fresh(&path);
        fs.create("f").unwrap();
        let fd = fs.open("f").unwrap();
        let payload = alphabet(n);
        assert_eq!(fs.write(fd, &payload).unwrap(), n);
        assert_eq!(fs.filesize(fd).unwrap(), n);
        fs.unmount().unwrap();
    }
}

#[test]
fn overlapping_write_patches_the_middle() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    let original = alphabet(MIB);

    fs.create("f").unwrap();
    let fd = fs.open("f").unwrap();
    assert_eq!(fs.write(fd, &original).unwrap(), MIB);
    fs.seek(fd, 500).unwrap();
    assert_eq!(fs.write(fd, &[b'B'; 100]).unwrap(), 100);
    assert_eq!(fs.filesize(fd).unwrap(), MIB);

    let mut expected = original;
    expected[500..600].fill(b'B');
    fs.seek(fd, 0).unwrap();
    let mut back = vec![0u8; MIB];
    assert_eq!(fs.read(fd, &mut back).unwrap(), MIB);
    assert_eq!(back, expected);
    fs.unmount().unwrap();
}

#[test]
fn sixteen_one_mib_files_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    let payload = |tag: usize| -> Vec<u8> {
        (0..MIB).map(|i| ((i * 7 + tag * 13) % 251) as u8).collect()
    };

    for tag in 0..16 {
        let name = format!("file{tag}");
        fs.create(&name).unwrap();
        let fd = fs.open(&name).unwrap();
        assert_eq!(fs.write(fd, &payload(tag)).unwrap(), MIB);
        fs.close(fd).unwrap();
    }
    for tag in 0..16 {
        let fd = fs.open(&format!("file{tag}")).unwrap();
        let mut back = vec![0u8; MIB];
        assert_eq!(fs.read(fd, &mut back).unwrap(), MIB);
        assert_eq!(back, payload(tag), "file{tag} did not round-trip");
        fs.close(fd).unwrap();
    }
    fs.unmount().unwrap();
}

#[test]
fn double_indirect_files_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    // 12 MiB spans the direct, single-indirect, and double-indirect tiers.
    let payload: Vec<u8> = (0..12 * MIB).map(|i| (i % 251) as u8).collect();

    fs.create("big").unwrap();
    let fd = fs.open("big").unwrap();
    assert_eq!(fs.write(fd, &payload).unwrap(), payload.len());
    fs.seek(fd, 0).unwrap();
    let mut back = vec![0u8; payload.len()];
    assert_eq!(fs.read(fd, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);

    // A patch deep in the double-indirect region sticks.
    let at = 11 * MIB + 137;
    fs.seek(fd, at as i64).unwrap();
    assert_eq!(fs.write(fd, b"patched").unwrap(), 7);
    fs.seek(fd, at as i64).unwrap();
    let mut small = [0u8; 7];
    assert_eq!(fs.read(fd, &mut small).unwrap(), 7);
    assert_eq!(&small, b"patched");
    fs.unmount().unwrap();
}

#[test]
fn truncate_contract() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    fs.create("f").unwrap();
    let fd = fs.open("f").unwrap();
    assert_eq!(fs.write(fd, b"hello world\0").unwrap(), 12);

    fs.truncate(fd, 5).unwrap();
    assert_eq!(fs.filesize(fd).unwrap(), 5);
    // The offset was past the new end and is clamped to it.
    let mut after = [0u8; 8];
    assert_eq!(fs.read(fd, &mut after).unwrap(), 0);
    fs.seek(fd, 0).unwrap();
    let mut back = [0u8; 8];
    assert_eq!(fs.read(fd, &mut back).unwrap(), 5);
    assert_eq!(&back[..5], b"hello");

    // Neither negative lengths nor extension are allowed, and a failed
    // truncate changes nothing.
    assert!(matches!(fs.truncate(fd, -1), Err(FsError::BadLength)));
    assert!(matches!(fs.truncate(fd, 6), Err(FsError::BadLength)));
    assert_eq!(fs.filesize(fd).unwrap(), 5);
    fs.unmount().unwrap();
}

#[test]
fn truncate_frees_indirect_chains() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    fs.create("f").unwrap();
    let fd = fs.open("f").unwrap();
    // Deep enough to allocate single- and double-indirect chains, and big
    // enough that two copies only fit if truncation frees the first.
    let payload = alphabet(16 * MIB);
    assert_eq!(fs.write(fd, &payload).unwrap(), payload.len());

    fs.truncate(fd, 100).unwrap();
    assert_eq!(fs.filesize(fd).unwrap(), 100);
    fs.seek(fd, 0).unwrap();
    let mut back = [0u8; 100];
    assert_eq!(fs.read(fd, &mut back).unwrap(), 100);
    assert_eq!(back[..], payload[..100]);

    // The freed blocks are genuinely reusable: a second large file fits.
    fs.create("g").unwrap();
    let fd2 = fs.open("g").unwrap();
    assert_eq!(fs.write(fd2, &payload).unwrap(), payload.len());
    fs.unmount().unwrap();
}

#[test]
fn delete_while_open_is_forbidden() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    fs.create("f").unwrap();
    let fd = fs.open("f").unwrap();
    assert!(matches!(fs.delete("f"), Err(FsError::Busy)));
    fs.close(fd).unwrap();
    fs.delete("f").unwrap();
    assert!(matches!(fs.open("f"), Err(FsError::NotFound)));
    fs.unmount().unwrap();
}

#[test]
fn delete_returns_every_block_to_the_pool() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    let payload = alphabet(4 * MIB);
    // Ten rounds of a 4 MiB file exceed the pool unless deletion frees
    // data and indirect blocks alike.
    for round in 0..10 {
        fs.create("big").unwrap();
        let fd = fs.open("big").unwrap();
        assert_eq!(
            fs.write(fd, &payload).unwrap(),
            payload.len(),
            "blocks leaked before round {round}"
        );
        fs.close(fd).unwrap();
        fs.delete("big").unwrap();
    }
    fs.unmount().unwrap();
}

#[test]
fn full_disk_yields_a_partial_write() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    fs.create("hog").unwrap();
    let fd = fs.open("hog").unwrap();

    let huge = alphabet(40 * MIB);
    let written = fs.write(fd, &huge).unwrap();
    assert!(written < huge.len(), "the disk cannot hold 40 MiB");
    assert!(written > 30 * MIB, "wrote suspiciously little: {written}");
    assert_eq!(fs.filesize(fd).unwrap(), written);

    // Completely full now: further writes report zero bytes.
    assert_eq!(fs.write(fd, b"more").unwrap(), 0);

    fs.seek(fd, 0).unwrap();
    let mut back = vec![0u8; MIB];
    assert_eq!(fs.read(fd, &mut back).unwrap(), MIB);
    assert_eq!(back[..], huge[..MIB]);
    fs.unmount().unwrap();
}

#[test]
fn randomized_payload_round_trips() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let payload: Vec<u8> = (0..100_000).map(|_| rng.gen()).collect();

    fs.create("noise").unwrap();
    let fd = fs.open("noise").unwrap();
    assert_eq!(fs.write(fd, &payload).unwrap(), payload.len());

    // Read it back in randomly sized pieces.
    fs.seek(fd, 0).unwrap();
    let mut back = Vec::with_capacity(payload.len());
    loop {
        let mut piece = vec![0u8; rng.gen_range(1..10_000)];
        let n = fs.read(fd, &mut piece).unwrap();
        if n == 0 {
            break;
        }
        back.extend_from_slice(&piece[..n]);
    }
    assert_eq!(back, payload);
    fs.unmount().unwrap();
}

#[test]
fn descriptors_are_independent() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    fs.create("f").unwrap();
    let writer = fs.open("f").unwrap();
    let reader = fs.open("f").unwrap();
    assert_eq!(fs.write(writer, b"independent").unwrap(), 11);
    // The second descriptor still sits at offset zero.
    let mut back = [0u8; 11];
    assert_eq!(fs.read(reader, &mut back).unwrap(), 11);
    assert_eq!(&back, b"independent");
    fs.close(writer).unwrap();
    fs.close(reader).unwrap();

    // The descriptor table holds exactly NFD slots.
    let fds: Vec<i32> = (0..NFD).map(|_| fs.open("f").unwrap()).collect();
    assert!(matches!(fs.open("f"), Err(FsError::NoDescriptors)));
    for fd in fds {
        fs.close(fd).unwrap();
    }
    fs.unmount().unwrap();
}

#[test]
fn seek_bounds() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    fs.create("f").unwrap();
    let fd = fs.open("f").unwrap();
    assert_eq!(fs.write(fd, b"0123456789").unwrap(), 10);
    assert!(matches!(fs.seek(fd, -1), Err(FsError::BadOffset)));
    assert!(matches!(fs.seek(fd, 11), Err(FsError::BadOffset)));
    fs.seek(fd, 10).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 0);
    fs.unmount().unwrap();
}

#[test]
fn names_are_validated_and_unique() {
    let dir = TempDir::new().unwrap();
    let mut fs = fresh(&image(&dir, "disk.img"));
    fs.create("exactly.15.ch..").unwrap();
    assert!(matches!(fs.create("exactly.15.ch.."), Err(FsError::Exists)));
    assert!(matches!(fs.create(""), Err(FsError::BadName)));
    assert!(matches!(
        fs.create("sixteen.chars..!"),
        Err(FsError::BadName)
    ));

    // The table tops out at 64 files.
    for i in 1..64 {
        fs.create(&format!("file{i}")).unwrap();
    }
    assert!(matches!(fs.create("one.too.many"), Err(FsError::NoInodes)));
    fs.unmount().unwrap();
}

#[test]
fn listing_survives_remount() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let mut fs = fresh(&path);
    for name in ["alpha", "beta", "gamma"] {
        fs.create(name).unwrap();
    }
    fs.unmount().unwrap();

    let mut fs = FileSystem::mount(&path).unwrap();
    let mut names = fs.list_files();
    names.sort();
    assert_eq!(names, ["alpha", "beta", "gamma"]);
    fs.delete("beta").unwrap();
    let mut names = fs.list_files();
    names.sort();
    assert_eq!(names, ["alpha", "gamma"]);
    fs.unmount().unwrap();
}

#[test]
fn create_delete_restores_the_image() {
    // After create/write/delete, a flushed image is byte-identical to a
    // flushed empty one: the bitmap and inode table fully recover.
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");

    let fs = fresh(&path);
    fs.unmount().unwrap();
    let pristine = std::fs::read(&path).unwrap();

    let mut fs = FileSystem::mount(&path).unwrap();
    fs.create("ephemeral").unwrap();
    let fd = fs.open("ephemeral").unwrap();
    assert_eq!(fs.write(fd, &alphabet(5000)).unwrap(), 5000);
    fs.close(fd).unwrap();
    fs.delete("ephemeral").unwrap();
    fs.unmount().unwrap();

    let after = std::fs::read(&path).unwrap();
    // Metadata blocks match exactly; data blocks may retain stale bytes
    // but are unreachable and free.
    assert_eq!(pristine[..4 * BLOCK_SIZE], after[..4 * BLOCK_SIZE]);
}

#[test]
fn flat_api_mount_gating_and_round_trip() {
    init_logs();
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "flat.img");
    let name = path.to_str().unwrap();

    assert_eq!(ulsys::umount_fs(name), -1);
    assert_eq!(ulsys::mount_fs(dir.path().join("missing.img").to_str().unwrap()), -1);

    assert_eq!(ulsys::make_fs(name), 0);
    assert_eq!(ulsys::mount_fs(name), 0);
    assert_eq!(ulsys::mount_fs(name), -1);

    assert_eq!(ulsys::fs_create("hello"), 0);
    let fd = ulsys::fs_open("hello");
    assert!(fd >= 0);
    assert_eq!(ulsys::fs_write(fd, b"hello world"), 11);
    assert_eq!(ulsys::fs_lseek(fd, 0), 0);
    let mut back = [0u8; 11];
    assert_eq!(ulsys::fs_read(fd, &mut back), 11);
    assert_eq!(&back, b"hello world");
    assert_eq!(ulsys::fs_get_filesize(fd), 11);

    let mut files = Vec::new();
    assert_eq!(ulsys::fs_listfiles(&mut files), 0);
    assert_eq!(files, ["hello"]);

    assert_eq!(ulsys::fs_delete("hello"), -1); // still open
    assert_eq!(ulsys::fs_close(fd), 0);
    assert_eq!(ulsys::fs_delete("hello"), 0);

    assert_eq!(ulsys::umount_fs(name), 0);
    assert_eq!(ulsys::umount_fs(name), -1);
    assert_eq!(ulsys::fs_create("nope"), -1);

    // A freshly made image is not all zeros.
    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.iter().any(|&b| b != 0));
}
