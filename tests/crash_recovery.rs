use quartz::{Database, Document, WritableDatabase};
use test_log::test;

/// The version file is the commit point: table files are flushed and
/// synced before it is atomically replaced. A crash in between leaves new
/// blocks in the table files but the old version record in charge — the
/// database must open cleanly at the old revision.
#[test]
fn interrupted_commit_recovers_to_prior_revision() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let version_file = folder.path().join("iamquartz");

    let mut db = WritableDatabase::create(folder.path())?;
    for n in 0..300u32 {
        let mut doc = Document::new();
        doc.add_term(format!("stable{n}"), 1);
        doc.add_term("anchor", 1);
        doc.set_data(format!("stable doc {n}"));
        db.add_document(doc)?;
    }
    db.commit()?;

    // Remember the revision-1 version record, then let revision 2 write
    // its table blocks — and "crash" by restoring the old version file,
    // exactly as if the rename had never happened.
    let before = std::fs::read(&version_file)?;
    for did in 1..=300u32 {
        let mut doc = Document::new();
        doc.add_term(format!("clobber{did}"), 1);
        db.replace_document(did, doc)?;
    }
    db.commit()?;
    drop(db);
    std::fs::write(&version_file, &before)?;

    // The database opens at revision 1 with everything intact.
    let recovered = Database::open(folder.path())?;
    assert_eq!(1, recovered.revision());
    assert_eq!(300, recovered.doc_count());
    assert_eq!(300, recovered.term_freq(b"anchor")?);
    for n in (0..300u32).step_by(23) {
        assert_eq!(1, recovered.term_freq(format!("stable{n}").as_bytes())?);
        assert_eq!(0, recovered.term_freq(format!("clobber{}", n + 1).as_bytes())?);
        assert_eq!(
            format!("stable doc {n}").into_bytes(),
            recovered.document_data(n + 1)?,
        );
    }

    let mut postings = recovered.postings(b"anchor")?.expect("anchor indexed");
    let mut count = 0;
    while let Some((_, wdf)) = postings.next()? {
        assert_eq!(1, wdf);
        count += 1;
    }
    assert_eq!(300, count);
    Ok(())
}

/// After recovery the database accepts new writes and commits normally.
#[test]
fn recovered_database_is_writable_again() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let version_file = folder.path().join("iamquartz");

    let mut db = WritableDatabase::create(folder.path())?;
    let mut doc = Document::new();
    doc.add_term("kept", 1);
    db.add_document(doc)?;
    db.commit()?;

    let before = std::fs::read(&version_file)?;
    let mut doc = Document::new();
    doc.add_term("lost", 1);
    db.add_document(doc)?;
    db.commit()?;
    drop(db);
    std::fs::write(&version_file, &before)?;

    let mut db = WritableDatabase::open(folder.path())?;
    assert_eq!(1, db.doc_count());
    let mut doc = Document::new();
    doc.add_term("recovered", 1);
    db.add_document(doc)?;
    db.commit()?;

    assert_eq!(2, db.doc_count());
    assert_eq!(1, db.term_freq(b"kept")?);
    assert_eq!(0, db.term_freq(b"lost")?);
    assert_eq!(1, db.term_freq(b"recovered")?);
    Ok(())
}

/// A corrupted newer record in the version file falls back to the older
/// copy instead of refusing to open.
#[test]
fn torn_version_record_falls_back() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let version_file = folder.path().join("iamquartz");

    let mut db = WritableDatabase::create(folder.path())?;
    let mut doc = Document::new();
    doc.add_term("one", 1);
    db.add_document(doc)?;
    db.commit()?;
    let mut doc = Document::new();
    doc.add_term("two", 1);
    db.add_document(doc)?;
    db.commit()?;
    drop(db);

    // Scribble over a byte inside the first (newer) record's body.
    let mut bytes = std::fs::read(&version_file)?;
    bytes[30] ^= 0xff;
    std::fs::write(&version_file, &bytes)?;

    let recovered = Database::open(folder.path())?;
    assert_eq!(1, recovered.revision());
    assert_eq!(1, recovered.doc_count());
    Ok(())
}
