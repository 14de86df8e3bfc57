//! Property tests: content round-trips under arbitrary write schedules,
//! name codec round-trips, and size accounting.

use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;
use veilfs::{
    CryptoFileSystem, CryptoFsOptions, Cryptor, MasterKey, OpenOptions, StaticMasterkeyLoader,
};

fn open_fs(vault: &std::path::Path) -> CryptoFileSystem {
    let loader = StaticMasterkeyLoader::new(MasterKey::new([3u8; 32], [5u8; 32]));
    CryptoFileSystem::open(vault, &loader, CryptoFsOptions::default()).unwrap()
}

fn test_cryptor() -> Cryptor {
    Cryptor::new(Arc::new(MasterKey::new([3u8; 32], [5u8; 32])))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Any schedule of positioned writes produces the same bytes as the same
    /// schedule applied to a plain in-memory buffer.
    #[test]
    fn write_schedule_matches_model(
        schedule in prop::collection::vec(
            (0u64..150_000, prop::collection::vec(any::<u8>(), 1..4096)),
            1..10,
        )
    ) {
        let vault = TempDir::new().unwrap();
        let fs = open_fs(vault.path());
        let channel = fs
            .open_file("/model", OpenOptions::new().read(true).write(true).create(true))
            .unwrap();

        let mut model: Vec<u8> = Vec::new();
        for (offset, data) in &schedule {
            channel.write_at(*offset, data).unwrap();

            let end = *offset as usize + data.len();
            if model.len() < end {
                model.resize(end, 0);
            }
            model[*offset as usize..end].copy_from_slice(data);
        }

        prop_assert_eq!(channel.size() as usize, model.len());
        channel.close().unwrap();

        // Through a fresh open, straight off the ciphertext.
        let readback = fs.read_file("/model").unwrap();
        prop_assert_eq!(readback, model);
    }

    /// Truncating after writes behaves like truncating the model buffer.
    #[test]
    fn truncate_matches_model(
        len in 1usize..120_000,
        cut in 0u64..120_000,
    ) {
        let vault = TempDir::new().unwrap();
        let fs = open_fs(vault.path());

        let payload: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        fs.write_file("/t", &payload).unwrap();

        let channel = fs
            .open_file("/t", OpenOptions::new().read(true).write(true))
            .unwrap();
        channel.truncate(cut).unwrap();
        channel.close().unwrap();

        let expected = &payload[..payload.len().min(cut as usize)];
        prop_assert_eq!(fs.read_file("/t").unwrap(), expected);
    }

    /// Reported size equals written length, surviving a close and reopen.
    #[test]
    fn size_survives_reopen(size in 0usize..120_000) {
        let vault = TempDir::new().unwrap();
        {
            let fs = open_fs(vault.path());
            fs.write_file("/sized", &vec![0x5Au8; size]).unwrap();
            fs.close().unwrap();
        }
        let fs = open_fs(vault.path());
        prop_assert_eq!(fs.attributes("/sized").unwrap().size, size as u64);
        prop_assert_eq!(fs.read_file("/sized").unwrap().len(), size);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Encrypt/decrypt of names is the identity for any legal name.
    #[test]
    fn name_roundtrip(
        name in "[a-zA-Z0-9 ._()\u{00E0}-\u{00FF}-]{1,80}",
        dir_id in "[a-f0-9-]{0,36}",
    ) {
        let cryptor = test_cryptor();
        let encrypted = cryptor.encrypt_name(&name, &dir_id).unwrap();
        let decrypted = cryptor.decrypt_name(&encrypted, &dir_id).unwrap();
        prop_assert_eq!(decrypted, name);
    }

    /// Name encryption is deterministic, and so is its shortform.
    #[test]
    fn shortening_idempotent(name in "[a-zA-Z0-9._-]{1,120}") {
        let cryptor = test_cryptor();
        let a = veilfs::fs::name::encrypt_name(&cryptor, &name, "some-dir", 50).unwrap();
        let b = veilfs::fs::name::encrypt_name(&cryptor, &name, "some-dir", 50).unwrap();
        prop_assert_eq!(&a, &b);
        if a.shortened {
            prop_assert!(a.disk_name.ends_with(".c9s"));
            prop_assert_eq!(
                &a.disk_name,
                &format!("{}.c9s", veilfs::fs::name::shorten_name(&a.full_name))
            );
        }
    }
}
