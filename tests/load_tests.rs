/// Load engine tests
///
/// Round trips through a second engine sharing the database, polymorphic
/// loading, reference resolution and in-place refresh of live objects.
/// Run with: cargo test --test load_tests

mod common;

use common::{company, person, setup, setup_without_foreign_keys, text};
use relmap::sql::{ColumnRef, DeleteStatement, Filter};
use relmap::object::Severity;
use relmap::{ClassHorizon, FieldValue, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[tokio::test]
async fn test_round_trip_through_second_engine() {
    let fx = setup().await;
    let acme = company(&fx.engine, "Acme");
    let ada = person(&fx.engine, "Ada");
    ada.update(|p| {
        p.set_scalar("email", "ada@acme.test")?;
        p.set_reference("employer", Some(acme.reference()))?;
        p.set("nicknames", vec![Value::from("countess"), Value::from("enchantress")])?;
        let mut scores = BTreeMap::new();
        scores.insert(Value::from("math"), Value::from(10i64));
        p.set("scores", scores)
    })
    .unwrap()
    .unwrap();

    assert!(fx.engine.save(&ada).await.unwrap());
    assert!(acme.is_stored().unwrap());

    let peer = fx.peer().await;
    let people = peer.load("Person", None, None).await.unwrap();
    assert_eq!(people.len(), 1);

    let loaded = &people[0];
    assert_eq!(loaded.id(), ada.id());
    assert!(loaded.is_stored().unwrap());
    assert_eq!(text(loaded, "email").as_deref(), Some("ada@acme.test"));
    assert_eq!(
        loaded.with(|p| p.list("nicknames").map(<[Value]>::to_vec)).unwrap(),
        Some(vec![Value::from("countess"), Value::from("enchantress")])
    );
    assert_eq!(
        loaded
            .with(|p| p.entries("scores").and_then(|m| m.get(&Value::from("math")).cloned()))
            .unwrap(),
        Some(Value::Integer(10))
    );

    // the employer was loaded on demand and attached
    let employer = loaded.with(|p| p.reference_to("employer").cloned()).unwrap().unwrap();
    assert_eq!(employer, acme.reference());
    let loaded_acme = peer.lookup("Company", acme.id()).unwrap().unwrap();
    assert_eq!(text(&loaded_acme, "name").as_deref(), Some("Acme"));
    assert_eq!(peer.accumulation(&loaded_acme, "staff").unwrap().len(), 1);
}

#[tokio::test]
async fn test_load_returns_subclass_instances() {
    let fx = setup().await;
    person(&fx.engine, "Plain");
    let worker = fx.engine.create("Employee").unwrap();
    worker
        .update(|e| {
            e.set_scalar("name", "Grace")?;
            e.set_scalar("salary", 5000i64)
        })
        .unwrap()
        .unwrap();
    for handle in fx.engine.store().objects_of("Person").unwrap() {
        fx.engine.save(&handle).await.unwrap();
    }

    let peer = fx.peer().await;
    let people = peer.load("Person", None, None).await.unwrap();
    assert_eq!(people.len(), 2);
    assert_eq!(people[0].class(), "Person");
    assert_eq!(people[1].class(), "Employee");
    assert_eq!(
        people[1].with(|e| e.scalar("salary").cloned()).unwrap(),
        Some(Value::Integer(5000))
    );

    // the subclass family is addressable through its root class
    assert!(peer.lookup("Person", worker.id()).unwrap().unwrap().ptr_eq(&people[1]));

    let employees = peer.load("Employee", None, None).await.unwrap();
    assert_eq!(employees.len(), 1);
    assert!(employees[0].ptr_eq(&people[1]));
}

#[tokio::test]
async fn test_filter_and_limit() {
    let fx = setup().await;
    for name in ["Ada", "Bob", "Cy"] {
        let handle = person(&fx.engine, name);
        fx.engine.save(&handle).await.unwrap();
    }

    let peer = fx.peer().await;
    let filter = Filter::eq(ColumnRef::qualified("person", "name"), "Bob");
    let found = peer.load("Person", Some(filter), None).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(text(&found[0], "name").as_deref(), Some("Bob"));

    let first_two = peer.load("Person", None, Some(2)).await.unwrap();
    assert_eq!(first_two.len(), 2);
    assert_eq!(peer.store().len().unwrap(), 2);
}

#[tokio::test]
async fn test_reload_keeps_identity_and_refreshes_fields() {
    let fx = setup().await;
    let ada = person(&fx.engine, "Ada");
    fx.engine.save(&ada).await.unwrap();

    let peer = fx.peer().await;
    let remote = peer.load("Person", None, None).await.unwrap().remove(0);
    remote.update(|p| p.set_scalar("status", "busy")).unwrap().unwrap();
    peer.save(&remote).await.unwrap();

    let again = fx.engine.load("Person", None, None).await.unwrap();
    assert_eq!(again.len(), 1);
    assert!(again[0].ptr_eq(&ada));
    assert_eq!(text(&ada, "status").as_deref(), Some("busy"));
    assert!(ada.validity().unwrap().is_valid());
}

#[tokio::test]
async fn test_external_change_overwrites_local_change_with_warning() {
    let fx = setup().await;
    let ada = person(&fx.engine, "Ada");
    fx.engine.save(&ada).await.unwrap();

    let peer = fx.peer().await;
    let remote = peer.load("Person", None, None).await.unwrap().remove(0);
    remote.update(|p| p.set_scalar("name", "Ada L.")).unwrap().unwrap();
    peer.save(&remote).await.unwrap();

    ada.update(|p| {
        p.set_scalar("name", "Ada B.")?;
        p.set_scalar("email", "ada@local.test")
    })
    .unwrap()
    .unwrap();
    fx.engine.load("Person", None, None).await.unwrap();

    assert_eq!(text(&ada, "name").as_deref(), Some("Ada L."));
    let validity = ada.validity().unwrap();
    let issue = validity.issue("name").unwrap();
    assert_eq!(issue.severity, Severity::Warning);

    // untouched in the database, so the local edit survives
    assert_eq!(text(&ada, "email").as_deref(), Some("ada@local.test"));
    assert!(fx.engine.save(&ada).await.unwrap());
}

#[tokio::test]
async fn test_reload_discards_local_changes() {
    let fx = setup().await;
    let ada = person(&fx.engine, "Ada");
    fx.engine.save(&ada).await.unwrap();

    ada.update(|p| p.set_scalar("name", "Scratch")).unwrap().unwrap();
    assert!(fx.engine.reload(&ada).await.unwrap());
    assert_eq!(text(&ada, "name").as_deref(), Some("Ada"));
    assert!(!fx.engine.save(&ada).await.unwrap());

    let peer = fx.peer().await;
    let remote = peer.load("Person", None, None).await.unwrap().remove(0);
    assert!(peer.delete(&remote).await.unwrap());

    assert!(!fx.engine.reload(&ada).await.unwrap());
    assert!(!ada.is_stored().unwrap());
    assert!(fx.engine.lookup("Person", ada.id()).unwrap().is_none());
}

#[tokio::test]
async fn test_horizon_limits_eager_load_but_not_references() {
    let fx = setup().await;
    let ada = person(&fx.engine, "Ada");
    let bob = person(&fx.engine, "Bob");
    person(&fx.engine, "Cy");
    ada.update(|p| p.set_reference("friend", Some(bob.reference())))
        .unwrap()
        .unwrap();
    for handle in fx.engine.store().objects_of("Person").unwrap() {
        fx.engine.save(&handle).await.unwrap();
    }

    let horizon = ClassHorizon::new()
        .window("Person", Filter::eq(ColumnRef::qualified("person", "name"), "Ada"))
        .lazy("Company")
        .lazy("Badge")
        .lazy("Invoice")
        .lazy("Line")
        .lazy("Left")
        .lazy("Right");
    let peer = fx.peer().await.with_horizon(Arc::new(horizon));

    let loaded = peer.load_initial().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id(), ada.id());

    // Bob sits outside the window but Ada points at him
    let remote_bob = peer.lookup("Person", bob.id()).unwrap().unwrap();
    assert_eq!(text(&remote_bob, "name").as_deref(), Some("Bob"));
    assert_eq!(peer.store().len().unwrap(), 2);
}

#[tokio::test]
async fn test_ids_continue_above_persisted_rows() {
    let fx = setup().await;
    let mut last = 0;
    for name in ["Ada", "Bob"] {
        let handle = person(&fx.engine, name);
        fx.engine.save(&handle).await.unwrap();
        last = handle.id();
    }

    let peer = fx.peer().await;
    let fresh = peer.create("Person").unwrap();
    assert!(fresh.id() > last);
    assert!(!fresh.is_stored().unwrap());
    assert_eq!(
        fresh.with(|p| p.get("nicknames").cloned()).unwrap(),
        Some(FieldValue::List(Vec::new()))
    );
}

#[tokio::test]
async fn test_reference_to_subclass_resolves_to_concrete_class() {
    let fx = setup().await;
    let grace = fx.engine.create("Employee").unwrap();
    grace
        .update(|e| {
            e.set_scalar("name", "Grace")?;
            e.set_scalar("salary", 120i64)
        })
        .unwrap()
        .unwrap();
    let ada = person(&fx.engine, "Ada");
    ada.update(|p| p.set_reference("friend", Some(grace.reference())))
        .unwrap()
        .unwrap();
    fx.engine.save(&ada).await.unwrap();

    let peer = fx.peer().await;
    let filter = Filter::eq(ColumnRef::qualified("person", "name"), "Ada");
    let loaded = peer.load("Person", Some(filter), None).await.unwrap();
    assert_eq!(loaded.len(), 1);

    // declared as Person, stored as Employee
    let remote_grace = peer.lookup("Person", grace.id()).unwrap().unwrap();
    assert_eq!(remote_grace.class(), "Employee");
    assert_eq!(
        remote_grace.with(|e| e.scalar("salary").cloned()).unwrap(),
        Some(Value::Integer(120))
    );
    assert_eq!(
        loaded[0].with(|p| p.reference_to("friend").cloned()).unwrap(),
        Some(remote_grace.reference())
    );
    assert!(peer.store().unresolved().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_reference_target_stays_unresolved() {
    let fx = setup_without_foreign_keys().await;
    let ada = person(&fx.engine, "Ada");
    let bob = person(&fx.engine, "Bob");
    ada.update(|p| p.set_reference("friend", Some(bob.reference())))
        .unwrap()
        .unwrap();
    fx.engine.save(&ada).await.unwrap();

    let mut conn = fx.engine.pool().acquire(true).await.unwrap();
    conn.delete(&DeleteStatement::new("person", Filter::eq("id", bob.id())))
        .await
        .unwrap();
    conn.close().await.unwrap();

    let peer = fx.peer().await;
    let loaded = peer.load("Person", None, None).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].with(|p| p.reference_to("friend").cloned()).unwrap(), None);
    assert!(peer.lookup("Person", bob.id()).unwrap().is_none());

    let unresolved = peer.store().unresolved().unwrap();
    assert_eq!(unresolved.len(), 1);
    assert!(unresolved[0].holder.ptr_eq(&loaded[0]));
    assert_eq!(unresolved[0].field, "friend");
    assert_eq!(unresolved[0].target_id, bob.id());
}
