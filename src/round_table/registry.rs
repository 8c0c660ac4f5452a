use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::RwLock;

use crate::error::{Result, TableError};
use crate::round_table::knight::Knight;
use crate::round_table::table::Table;

/// Owns all live tables and knight sessions. Every engine instance gets
/// its own registry, so tests and deployments never share state.
#[derive(Default)]
pub struct SessionRegistry {
    pub(crate) tables: RwLock<HashMap<String, Table>>,
    pub(crate) knights: RwLock<HashMap<String, Knight>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table under a freshly generated id, regenerating on the
    /// (unlikely) collision with a live table.
    pub async fn reserve_table(&self, number_of_seats: u32) -> String {
        let mut tables = self.tables.write().await;
        let id = loop {
            let candidate = generate_table_id();
            if !tables.contains_key(&candidate) {
                break candidate;
            }
        };
        tables.insert(id.clone(), Table::new(id.clone(), number_of_seats));
        id
    }

    pub async fn register_knight(&self, knight: Knight) -> Result<()> {
        let mut knights = self.knights.write().await;
        if knights.contains_key(&knight.id) {
            return Err(TableError::DuplicateKnight(knight.id.clone()));
        }
        knights.insert(knight.id.clone(), knight);
        Ok(())
    }

    /// Removes and returns a knight. Remove-first semantics: of two
    /// concurrent teardown paths, exactly one gets the session and does
    /// the releasing.
    pub async fn remove_knight(&self, knight_id: &str) -> Option<Knight> {
        self.knights.write().await.remove(knight_id)
    }

    pub async fn remove_table(&self, table_id: &str) -> Option<Table> {
        self.tables.write().await.remove(table_id)
    }

    pub async fn table_exists(&self, table_id: &str) -> bool {
        self.tables.read().await.contains_key(table_id)
    }

    pub async fn knight_exists(&self, knight_id: &str) -> bool {
        self.knights.read().await.contains_key(knight_id)
    }
}

fn generate_table_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
