use ntdb::{
    size_to_bucket, Config, Error, LockFlags, Ntdb, Offset, OpenFlags, Record, USED_RECORD_SIZE,
};
use tempfile::TempDir;

// Common test setup
fn setup_test_db(flags: OpenFlags) -> (TempDir, Ntdb) {
    let temp_dir = TempDir::new().unwrap();
    let db = Ntdb::open(temp_dir.path().join("test.ntdb"), flags).unwrap();
    (temp_dir, db)
}

fn free_len(db: &Ntdb, off: Offset) -> u64 {
    match db.read_record(off).unwrap() {
        Record::Free(rec) => rec.len,
        other => panic!("expected a free record at {}, found {:?}", off, other),
    }
}

#[test]
fn test_exact_refit() {
    for flags in [OpenFlags::empty(), OpenFlags::NOMMAP] {
        let (_dir, db) = setup_test_db(flags);
        let a = db.allocate(0, 104, false).unwrap();
        let _barrier = db.allocate(0, 8, false).unwrap();

        db.free(a, USED_RECORD_SIZE + 104, LockFlags::WAIT, true).unwrap();
        let bucket = size_to_bucket(104);
        assert_eq!(db.find_free(a).unwrap(), Some((0, bucket)));

        // Same size back: same place, and the bucket empties.
        assert_eq!(db.allocate(0, 104, false).unwrap(), a);
        assert!(db.bucket_entries(0, bucket).unwrap().is_empty());
        assert_eq!(db.find_free(a).unwrap(), None);
    }
}

#[test]
fn test_split() {
    let (_dir, db) = setup_test_db(OpenFlags::empty());
    let a = db.allocate(0, 1000, false).unwrap();
    let _barrier = db.allocate(0, 8, false).unwrap();
    db.free(a, USED_RECORD_SIZE + 1000, LockFlags::WAIT, false).unwrap();

    let b = db.allocate(0, 100, false).unwrap();
    assert_eq!(b, a);

    // 1000 - 104 bytes remain, one header of which goes to the new record.
    let rest = a + USED_RECORD_SIZE + 104;
    assert_eq!(free_len(&db, rest), 880);
    assert_eq!(db.find_free(rest).unwrap(), Some((0, size_to_bucket(880))));
    assert!(db.stats().alloc_subtract > 0);
    db.check().unwrap();
}

#[test]
fn test_coalesce_adjacent_records() {
    let (_dir, db) = setup_test_db(OpenFlags::empty());
    let a = db.allocate(0, 48, false).unwrap();
    let b = db.allocate(0, 56, false).unwrap();
    let _barrier = db.allocate(0, 8, false).unwrap();
    assert_eq!(b, a + USED_RECORD_SIZE + 48);

    db.free(b, USED_RECORD_SIZE + 56, LockFlags::WAIT, true).unwrap();
    db.free(a, USED_RECORD_SIZE + 48, LockFlags::WAIT, true).unwrap();

    assert_eq!(free_len(&db, a), 48 + USED_RECORD_SIZE + 56);
    assert_eq!(db.find_free(b).unwrap(), None);
    assert_eq!(db.find_free(a).unwrap(), Some((0, size_to_bucket(120))));

    let stats = db.stats();
    assert_eq!(stats.alloc_coalesce_succeeded, 1);
    assert_eq!(stats.alloc_coalesce_num_merged, 1);
    assert_eq!(db.check().unwrap().adjacent_free, 0);
}

#[test]
fn test_no_coalesce_leaves_neighbours() {
    let (_dir, db) = setup_test_db(OpenFlags::empty());
    let a = db.allocate(0, 48, false).unwrap();
    let b = db.allocate(0, 56, false).unwrap();
    let _barrier = db.allocate(0, 8, false).unwrap();

    db.free(b, USED_RECORD_SIZE + 56, LockFlags::WAIT, false).unwrap();
    db.free(a, USED_RECORD_SIZE + 48, LockFlags::WAIT, false).unwrap();
    assert_eq!(free_len(&db, a), 48);
    assert!(db.find_free(b).unwrap().is_some());
    assert_eq!(db.check().unwrap().adjacent_free, 1);
}

#[test]
fn test_free_record_uses_header_length() {
    let (_dir, db) = setup_test_db(OpenFlags::empty());
    let a = db.allocate(3, 20, false).unwrap();
    let _barrier = db.allocate(0, 8, false).unwrap();
    db.free_record(a, LockFlags::WAIT, false).unwrap();
    assert_eq!(free_len(&db, a), 24);
    assert!(matches!(db.free_record(a, LockFlags::WAIT, false), Err(Error::NotFound)));
}

#[test]
fn test_housekeeping_on_counter_wrap() {
    let (_dir, db) = setup_test_db(OpenFlags::empty());
    let records: Vec<Offset> = (0..300).map(|_| db.allocate(0, 8, false).unwrap()).collect();
    for pair in records.windows(2) {
        assert_eq!(pair[1], pair[0] + 24);
    }

    // Freed in file order, each record's successor is still in use.
    for &off in &records {
        db.free(off, 24, LockFlags::WAIT, true).unwrap();
    }

    let stats = db.stats();
    assert_eq!(stats.alloc_coalesce_iterate_clash, 1);
    assert!(stats.alloc_coalesce_succeeded >= 15);
    let report = db.check().unwrap();
    assert!(report.adjacent_free < 299);
}

#[test]
fn test_many_operations_keep_lists_consistent() {
    let (_dir, db) = setup_test_db(OpenFlags::empty());
    let mut live = Vec::new();
    for i in 0..200u64 {
        let len = (i * 37) % 700 + 1;
        let off = db.allocate(i % 7, len, i % 5 == 0).unwrap();
        live.push(off);
        if i % 3 == 2 {
            let victim = live.remove((i as usize * 7) % live.len());
            db.free_record(victim, LockFlags::WAIT, i % 2 == 0).unwrap();
        }
    }
    let report = db.check().unwrap();
    assert_eq!(report.used_records, live.len() as u64 + 2);
    assert_eq!(report.used_bytes + report.free_bytes + 128, db.map_size());
}

#[test]
fn test_multiple_free_tables() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::new();
    config.set_free_tables(4).unwrap();
    let db = config.open(dir.path().join("tables.ntdb")).unwrap();
    assert_eq!(db.free_table_count(), 4);

    let offs: Vec<Offset> = (0..20).map(|i| db.allocate(0, 16 + i * 8, false).unwrap()).collect();
    for off in offs.iter().step_by(2) {
        db.free_record(*off, LockFlags::WAIT, true).unwrap();
    }
    let (table, _) = db.find_free(offs[0]).unwrap().unwrap();
    assert_eq!(table, db.current_free_table());
    db.check().unwrap();
}

#[test]
fn test_free_space_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reopen.ntdb");
    let (a, size) = {
        let db = Ntdb::open(&path, OpenFlags::empty()).unwrap();
        let a = db.allocate(0, 200, false).unwrap();
        let _barrier = db.allocate(0, 8, false).unwrap();
        db.free(a, USED_RECORD_SIZE + 200, LockFlags::WAIT, true).unwrap();
        db.sync().unwrap();
        (a, db.map_size())
    };

    let db = Ntdb::open(&path, OpenFlags::empty()).unwrap();
    assert_eq!(db.map_size(), size);
    assert_eq!(db.find_free(a).unwrap(), Some((0, size_to_bucket(200))));
    assert_eq!(db.allocate(0, 200, false).unwrap(), a);
}

#[test]
fn test_internal_database_grows() {
    let db = Config::new().open_internal().unwrap();
    let before = db.map_size();
    let big = db.allocate(0, 1 << 20, false).unwrap();
    assert!(db.map_size() >= before + (1 << 20));
    db.free_record(big, LockFlags::WAIT, true).unwrap();
    let report = db.check().unwrap();
    assert_eq!(report.used_records, 2);
    assert_eq!(db.stats().expands, 1);
}
