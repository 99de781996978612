use quartz::{Document, WritableDatabase};
use test_log::test;

fn doc_with_terms(terms: &[&str]) -> Document {
    let mut doc = Document::new();
    for term in terms {
        doc.add_term(term, 1);
    }
    doc
}

fn postings(db: &WritableDatabase, term: &[u8]) -> quartz::Result<Vec<(u32, u32)>> {
    let mut out = Vec::new();
    if let Some(mut reader) = db.postings(term)? {
        while let Some(entry) = reader.next()? {
            out.push(entry);
        }
    }
    Ok(out)
}

#[test]
fn index_one_document() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let mut db = WritableDatabase::create(folder.path())?;

    // "the quick brown fox", tokenized by the caller.
    let mut doc = doc_with_terms(&["brown", "fox", "quick", "the"]);
    doc.set_data("the quick brown fox");
    let did = db.add_document(doc)?;
    assert_eq!(1, did);
    db.commit()?;

    assert_eq!(1, db.doc_count());
    assert_eq!(4, db.doclen(1)?);
    assert_eq!(1, db.term_freq(b"fox")?);
    assert_eq!(1, db.collection_freq(b"fox")?);
    assert_eq!(vec![(1, 1)], postings(&db, b"fox")?);
    Ok(())
}

#[test]
fn second_document_grows_the_postings() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let mut db = WritableDatabase::create(folder.path())?;

    db.add_document(doc_with_terms(&["brown", "fox", "quick", "the"]))?;
    db.commit()?;

    // "fox fox the"
    let mut doc = Document::new();
    doc.add_term("fox", 2);
    doc.add_term("the", 1);
    db.add_document(doc)?;
    db.commit()?;

    assert_eq!(2, db.term_freq(b"fox")?);
    assert_eq!(3, db.collection_freq(b"fox")?);
    assert_eq!(vec![(1, 1), (2, 2)], postings(&db, b"fox")?);
    assert_eq!(7, db.total_doclen());
    Ok(())
}

#[test]
fn deleting_a_document_unindexes_it() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let mut db = WritableDatabase::create(folder.path())?;

    db.add_document(doc_with_terms(&["brown", "fox", "quick", "the"]))?;
    let mut doc = Document::new();
    doc.add_term("fox", 2);
    doc.add_term("the", 1);
    db.add_document(doc)?;
    db.commit()?;

    db.delete_document(1)?;
    db.commit()?;

    assert_eq!(1, db.doc_count());
    assert_eq!(0, db.term_freq(b"brown")?);
    assert_eq!(1, db.term_freq(b"fox")?);
    assert_eq!(vec![(2, 2)], postings(&db, b"fox")?);
    Ok(())
}

#[test]
fn frequencies_stay_consistent_through_churn() -> quartz::Result<()> {
    let folder = tempfile::tempdir()?;
    let mut db = WritableDatabase::create(folder.path())?;

    // Index, delete, re-index across several commits; the invariant
    // collection_freq >= termfreq >= 1 must hold for every live term.
    for round in 0..5u32 {
        for n in 0..20u32 {
            let mut doc = Document::new();
            doc.add_term("common", 1 + n % 3);
            doc.add_term(format!("term{n}"), 1);
            db.add_document(doc)?;
        }
        db.commit()?;

        if round % 2 == 1 {
            for did in (round * 20 + 1..round * 20 + 10).step_by(2) {
                db.delete_document(did)?;
            }
            db.commit()?;
        }
    }

    let tf = db.term_freq(b"common")?;
    let cf = db.collection_freq(b"common")?;
    assert!(tf >= 1);
    assert!(cf >= u64::from(tf), "cf {cf} < tf {tf}");

    // The posting list agrees with the frequency header exactly.
    let list = postings(&db, b"common")?;
    assert_eq!(tf as usize, list.len());
    assert_eq!(cf, list.iter().map(|(_, wdf)| u64::from(*wdf)).sum::<u64>());
    Ok(())
}
