/// Delete engine tests
///
/// Cascades through derived fields, back-reference neutralization and
/// restoration of the object store when the database refuses a delete.
/// Run with: cargo test --test delete_tests

mod common;

use common::{company, person, setup};
use relmap::{OrmError, Value};

#[tokio::test]
async fn test_cascade_deletes_dependents_and_clears_back_references() {
    let fx = setup().await;
    let invoice = fx.engine.create("Invoice").unwrap();
    invoice.update(|i| i.set_scalar("number", "INV-1")).unwrap().unwrap();
    fx.engine.save(&invoice).await.unwrap();

    let mut lines = Vec::new();
    for sku in ["apple", "pear"] {
        let line = fx.engine.create("Line").unwrap();
        line.update(|l| {
            l.set_scalar("sku", sku)?;
            l.set_reference("invoice", Some(invoice.reference()))
        })
        .unwrap()
        .unwrap();
        fx.engine.save(&line).await.unwrap();
        lines.push(line);
    }
    invoice
        .update(|i| i.set_reference("highlight", Some(lines[0].reference())))
        .unwrap()
        .unwrap();
    fx.engine.save(&invoice).await.unwrap();

    assert_eq!(fx.engine.accumulation(&invoice, "lines").unwrap().len(), 2);
    assert_eq!(fx.rows("line"), 2);

    assert!(fx.engine.delete(&invoice).await.unwrap());
    assert_eq!(fx.rows("invoice"), 0);
    assert_eq!(fx.rows("line"), 0);
    assert!(!invoice.is_stored().unwrap());
    for line in &lines {
        assert!(!line.is_stored().unwrap());
        assert!(fx.engine.lookup("Line", line.id()).unwrap().is_none());
    }
    // the invoice pointed at a line deleted before it
    assert_eq!(invoice.with(|i| i.reference_to("highlight").cloned()).unwrap(), None);
    assert_eq!(fx.database.open_transactions().unwrap(), 0);
}

#[tokio::test]
async fn test_refused_delete_restores_the_store() {
    let fx = setup().await;
    let acme = company(&fx.engine, "Acme");
    let ada = person(&fx.engine, "Ada");
    ada.update(|p| p.set_reference("employer", Some(acme.reference())))
        .unwrap()
        .unwrap();
    fx.engine.save(&ada).await.unwrap();

    // staff does not cascade, so Ada's row still references Acme
    let err = fx.engine.delete(&acme).await.unwrap_err();
    assert!(matches!(err, OrmError::Constraint(_)));

    assert!(acme.is_stored().unwrap());
    assert!(fx.engine.lookup("Company", acme.id()).unwrap().unwrap().ptr_eq(&acme));
    assert!(fx.engine.store().record(&acme).unwrap().is_some());
    assert_eq!(fx.rows("company"), 1);
    assert_eq!(
        ada.with(|p| p.reference_to("employer").cloned()).unwrap(),
        Some(acme.reference())
    );
    assert!(acme.validity().unwrap().exception.is_some());

    // once the referrer lets go the delete goes through
    ada.update(|p| p.set_reference("employer", None)).unwrap().unwrap();
    fx.engine.save(&ada).await.unwrap();
    assert!(fx.engine.delete(&acme).await.unwrap());
    assert_eq!(fx.rows("company"), 0);
}

#[tokio::test]
async fn test_delete_removes_entry_rows_and_all_levels() {
    let fx = setup().await;
    let grace = fx.engine.create("Employee").unwrap();
    grace
        .update(|e| {
            e.set_scalar("name", "Grace")?;
            e.set("nicknames", vec![Value::from("amazing")])
        })
        .unwrap()
        .unwrap();
    fx.engine.save(&grace).await.unwrap();
    assert_eq!(fx.rows("person__nicknames"), 1);

    assert!(fx.engine.delete(&grace).await.unwrap());
    assert_eq!(fx.rows("person__nicknames"), 0);
    assert_eq!(fx.rows("employee"), 0);
    assert_eq!(fx.rows("person"), 0);
}

#[tokio::test]
async fn test_delete_of_unsaved_object_only_unregisters() {
    let fx = setup().await;
    let draft = person(&fx.engine, "Draft");

    let before = fx.engine.statement_counts();
    assert!(fx.engine.delete(&draft).await.unwrap());
    assert_eq!(fx.engine.statement_counts().since(&before).writes(), 0);
    assert!(fx.engine.lookup("Person", draft.id()).unwrap().is_none());

    // a second delete finds nothing to do
    assert!(!fx.engine.delete(&draft).await.unwrap());
}

#[tokio::test]
async fn test_unsaved_reference_blocks_delete() {
    let fx = setup().await;
    let acme = company(&fx.engine, "Acme");
    let ada = person(&fx.engine, "Ada");
    fx.engine.save(&acme).await.unwrap();
    fx.engine.save(&ada).await.unwrap();

    // only in memory, so no foreign key sees it
    ada.update(|p| p.set_reference("employer", Some(acme.reference())))
        .unwrap()
        .unwrap();

    let err = fx.engine.delete(&acme).await.unwrap_err();
    match &err {
        OrmError::StillReferenced { holder, field, .. } => {
            assert_eq!(holder, &ada.reference().to_string());
            assert_eq!(field, "employer");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(acme.is_stored().unwrap());
    assert!(fx.engine.lookup("Company", acme.id()).unwrap().unwrap().ptr_eq(&acme));
    assert_eq!(fx.rows("company"), 1);
    assert_eq!(
        ada.with(|p| p.reference_to("employer").cloned()).unwrap(),
        Some(acme.reference())
    );
    assert_eq!(fx.database.open_transactions().unwrap(), 0);

    // the pending reference still saves
    assert!(fx.engine.save(&ada).await.unwrap());

    ada.update(|p| p.set_reference("employer", None)).unwrap().unwrap();
    fx.engine.save(&ada).await.unwrap();
    assert!(fx.engine.delete(&acme).await.unwrap());
    assert_eq!(fx.rows("company"), 0);
}
