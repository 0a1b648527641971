use anyhow::Result;

use crate::config::Config;
use crate::firestore::FirestoreStore;
use crate::gcs::GcsImageStore;

/// Probe both stores and print a health table. Used by `carelens status`;
/// failures show up in the table rather than failing the command.
pub async fn print_status(config: &Config) -> Result<()> {
    println!("{:<14} {:<8} MESSAGE", "SERVICE", "STATUS");

    match GcsImageStore::new(config) {
        Ok(store) => {
            let (ok, message) = store.test_connection().await;
            println!("{:<14} {:<8} {}", "image-store", status_label(ok), message);
        }
        Err(e) => println!("{:<14} {:<8} {}", "image-store", "ERROR", e),
    }

    match FirestoreStore::new(config) {
        Ok(store) => {
            let (ok, message) = store.test_connection().await;
            println!("{:<14} {:<8} {}", "record-store", status_label(ok), message);
        }
        Err(e) => println!("{:<14} {:<8} {}", "record-store", "ERROR", e),
    }

    Ok(())
}

fn status_label(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "ERROR"
    }
}
