use std::sync::Arc;

use ferrodoc::doc;
use ferrodoc::gateway::{BackendErrorKind, Gateway};
use ferrodoc::namespace::Namespace;
use ferrodoc::store::PgStore;
use ferrodoc::translate;

#[path = "common/postgres.rs"]
mod pg;
#[path = "common/wire.rs"]
mod wire;

use wire::{Client, code, first_batch, ok};

#[tokio::test]
async fn store_maps_missing_relations() {
    let testdb = match pg::TestDb::provision_from_env().await {
        Some(db) => db,
        None => {
            eprintln!("skipping: set FERRODOC_TEST_POSTGRES_URL");
            return;
        }
    };
    let store = PgStore::connect(&testdb.url, 2).await.unwrap();

    let ns = Namespace::new("absent", "nothing").unwrap();
    let err = store.execute(&translate::drop_table(&ns)).await.unwrap_err();
    assert_eq!(err.kind, BackendErrorKind::ObjectNotFound);

    store.execute(&translate::create_schema("present")).await.unwrap();
    let ns = Namespace::new("present", "t").unwrap();
    store.execute(&translate::create_table(&ns, false)).await.unwrap();
    let err = store
        .execute(&translate::create_table(&ns, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind, BackendErrorKind::AlreadyExists);

    let rows = store.query(&translate::schema_exists("present")).await.unwrap();
    assert_eq!(rows[0][0].as_int(), Some(1));
}

#[tokio::test]
async fn crud_against_postgres() {
    let testdb = match pg::TestDb::provision_from_env().await {
        Some(db) => db,
        None => {
            eprintln!("skipping: set FERRODOC_TEST_POSTGRES_URL");
            return;
        }
    };
    let store = PgStore::connect(&testdb.url, 4).await.unwrap();
    let server = wire::start(Arc::new(store)).await;
    let mut client = Client::connect(server.addr).await;
    let db = format!("db_{}", pg::rand_suffix(6).to_lowercase());

    let reply = client
        .command(doc! {
            "insert": "items",
            "documents": vec![
                doc! { "_id": 1i32, "color": "red", "n": 9_007_199_254_740_993i64 },
                doc! { "_id": 2i32, "color": "blue", "qty": 3.0f64 },
            ],
            "$db": db.as_str(),
        })
        .await;
    assert_eq!(reply.get_i64("n"), Ok(2), "{reply:?}");

    let reply = client
        .command(doc! { "find": "items", "filter": doc! { "color": "red" }, "$db": db.as_str() })
        .await;
    let batch = first_batch(&reply);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].get_i64("n"), Ok(9_007_199_254_740_993));

    // an int32 filter finds the double stored under the same number
    let reply = client
        .command(doc! { "find": "items", "filter": doc! { "qty": 3i32 }, "$db": db.as_str() })
        .await;
    let batch = first_batch(&reply);
    assert_eq!(batch.len(), 1, "{reply:?}");
    assert_eq!(batch[0].get("_id"), Some(&ferrodoc::types::Value::Int32(2)));

    let reply = client
        .command(doc! { "count": "items", "$db": db.as_str() })
        .await;
    assert_eq!(reply.get_i64("n"), Ok(2));

    // quoting keeps hostile names inside one identifier
    let hostile = "x\"; DROP SCHEMA public; --";
    let reply = client
        .command(doc! { "create": hostile, "$db": db.as_str() })
        .await;
    assert_eq!(ok(&reply), 1.0, "{reply:?}");
    let reply = client
        .command(doc! { "drop": hostile, "$db": db.as_str() })
        .await;
    assert_eq!(ok(&reply), 1.0, "{reply:?}");

    let reply = client.command(doc! { "drop": "items", "$db": db.as_str() }).await;
    assert_eq!(reply.get_str("ns"), Ok(format!("{db}.items").as_str()));
    let reply = client.command(doc! { "drop": "items", "$db": db.as_str() }).await;
    assert_eq!(code(&reply), 26);

    let reply = client
        .command(doc! { "dropDatabase": 1i32, "$db": db.as_str() })
        .await;
    assert_eq!(reply.get_str("dropped"), Ok(db.as_str()));

    let _ = server.shutdown.send(true);
    server.handle.await.unwrap().unwrap();
}
