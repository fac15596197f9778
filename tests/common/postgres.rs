#![allow(dead_code)]

use rand::{Rng, distributions::Alphanumeric};
use tokio_postgres::NoTls;

/// A throwaway database on the server named by `FERRODOC_TEST_POSTGRES_URL`,
/// dropped again when the value goes out of scope.
pub struct TestDb {
    admin_url: String,
    pub dbname: String,
    pub url: String,
}

impl TestDb {
    pub async fn provision_from_env() -> Option<Self> {
        let admin_url = std::env::var("FERRODOC_TEST_POSTGRES_URL").ok()?;
        let dbname = format!("ferrodoc_test_{}", rand_suffix(8).to_lowercase());
        let url = replace_db_name(&admin_url, &dbname);

        let (client, conn) = tokio_postgres::connect(&admin_url, NoTls).await.ok()?;
        tokio::spawn(async move {
            let _ = conn.await;
        });
        client
            .batch_execute(&format!("CREATE DATABASE \"{dbname}\" TEMPLATE template0"))
            .await
            .ok()?;

        Some(Self {
            admin_url,
            dbname,
            url,
        })
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        // the test's runtime may already be gone; use a private one
        let admin_url = self.admin_url.clone();
        let dbname = self.dbname.clone();
        let _ = std::thread::spawn(move || {
            let Ok(rt) = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            else {
                return;
            };
            rt.block_on(async move {
                if let Ok((client, conn)) = tokio_postgres::connect(&admin_url, NoTls).await {
                    tokio::spawn(async move {
                        let _ = conn.await;
                    });
                    let _ = client
                        .batch_execute(&format!("DROP DATABASE IF EXISTS \"{dbname}\" WITH (FORCE)"))
                        .await;
                }
            });
        })
        .join();
    }
}

pub fn rand_suffix(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

fn replace_db_name(url: &str, new_db: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (url, None),
    };
    let pos = base.rfind('/').unwrap_or(base.len());
    let mut out = format!("{}{new_db}", &base[..pos + 1]);
    if let Some(q) = query {
        out.push('?');
        out.push_str(q);
    }
    out
}
