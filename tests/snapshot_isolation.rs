use quartz::{Database, Document, WritableDatabase};
use test_log::test;

#[test]
fn reader_keeps_its_revision_while_writer_advances() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let mut db = WritableDatabase::create(folder.path())?;

    for n in 0..200u32 {
        let mut doc = Document::new();
        doc.add_term(format!("gen1-{n}"), 1);
        doc.set_data(format!("first generation {n}"));
        db.add_document(doc)?;
    }
    db.commit()?;

    // A reader opens revision 1 and keeps it.
    let reader = Database::open(folder.path())?;
    assert_eq!(200, reader.doc_count());

    // The writer replaces every document and commits twice more, which
    // recycles blocks the first revision stopped using.
    for round in 2..4u32 {
        for did in 1..=200u32 {
            let mut doc = Document::new();
            doc.add_term(format!("gen{round}-{did}"), 1);
            doc.set_data(format!("generation {round} doc {did}"));
            db.replace_document(did, doc)?;
        }
        db.commit()?;
    }

    // The old snapshot is still exactly revision 1.
    assert_eq!(200, reader.doc_count());
    for n in (0..200u32).step_by(17) {
        assert_eq!(
            1,
            reader.term_freq(format!("gen1-{n}").as_bytes())?,
            "gen1-{n}",
        );
        assert_eq!(
            format!("first generation {n}").into_bytes(),
            reader.document_data(n + 1)?,
        );
    }
    assert_eq!(0, reader.term_freq(b"gen3-1")?);
    Ok(())
}

#[test]
fn batched_ingest_never_shows_torn_reads() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let mut db = WritableDatabase::create(folder.path())?;

    let mut last_count = 0;
    for batch in 0..10u32 {
        for n in 0..100u32 {
            let id = batch * 100 + n;
            let mut doc = Document::new();
            doc.add_term(format!("term{id}"), 1);
            db.add_document(doc)?;
        }
        db.commit()?;

        // A fresh reader after each commit sees a complete batch: the
        // document count moves monotonically and matches the termfreqs.
        let reader = Database::open(folder.path())?;
        let count = reader.doc_count();
        assert!(count >= last_count);
        assert_eq!((batch + 1) * 100, count);
        last_count = count;

        for probe in [0, batch * 100, batch * 100 + 99] {
            assert_eq!(
                1,
                reader.term_freq(format!("term{probe}").as_bytes())?,
                "term{probe} at batch {batch}",
            );
        }
        assert_eq!(0, reader.term_freq(format!("term{}", (batch + 1) * 100).as_bytes())?);
    }
    Ok(())
}

#[test]
fn doclen_reader_covers_every_document() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let mut db = WritableDatabase::create(folder.path())?;

    for n in 1..=1500u32 {
        let mut doc = Document::new();
        doc.add_term("filler", n % 9 + 1);
        db.add_document(doc)?;
    }
    db.commit()?;

    let reader = Database::open(folder.path())?;
    let mut doclens = reader.doclens()?.expect("non-empty database");
    let mut count = 0u64;
    let mut total = 0u64;
    let mut prev = 0u32;
    while let Some((did, len)) = doclens.next()? {
        assert!(did > prev, "docids must ascend");
        prev = did;
        count += 1;
        total += u64::from(len);
    }
    assert_eq!(1500, count);
    assert_eq!(reader.total_doclen(), total);
    Ok(())
}
