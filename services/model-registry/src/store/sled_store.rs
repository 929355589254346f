use async_trait::async_trait;
use sled::transaction::{abort, ConflictableTransactionResult, TransactionError, TransactionalTree};
use std::path::Path;
use tracing::debug;

use super::{Guard, IndexEntry, KvStore, Scan, StoreError, WriteBatch, WriteOp};

const SEP: u8 = 0x1f;
const TREE: &str = "registry";

// Layout inside one tree, so a batch spanning tables is a single transaction:
//   d SEP table SEP key                        -> value
//   i SEP table SEP index SEP value SEP key    -> key
//   r SEP table SEP key                        -> json [IndexEntry] (postings to drop on rewrite)
fn data_key(table: &str, key: &str) -> Vec<u8> { join(&[b"d", table.as_bytes(), key.as_bytes()]) }
fn rev_key(table: &str, key: &str) -> Vec<u8> { join(&[b"r", table.as_bytes(), key.as_bytes()]) }
fn index_prefix(table: &str, index: &str, value: &str) -> Vec<u8> {
    let mut k = join(&[b"i", table.as_bytes(), index.as_bytes(), value.as_bytes()]);
    k.push(SEP);
    k
}
fn index_key(table: &str, ix: &IndexEntry, key: &str) -> Vec<u8> {
    let mut k = index_prefix(table, &ix.index, &ix.value);
    k.extend_from_slice(key.as_bytes());
    k
}

fn join(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, p) in parts.iter().enumerate() {
        if i > 0 { out.push(SEP); }
        out.extend_from_slice(p);
    }
    out
}

#[derive(Clone)]
pub struct SledStore { db: sled::Db, tree: sled::Tree }

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway store removed on drop; used by tests and ephemeral runs.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(TREE)?;
        Ok(Self { db, tree })
    }

    fn decode_key(raw: &[u8], prefix_len: usize) -> Result<String, StoreError> {
        String::from_utf8(raw[prefix_len..].to_vec()).map_err(|e| StoreError::Corrupt { key: String::from_utf8_lossy(raw).into_owned(), reason: e.to_string() })
    }
}

fn drop_postings(tx: &TransactionalTree, table: &str, key: &str) -> ConflictableTransactionResult<(), StoreError> {
    let rk = rev_key(table, key);
    if let Some(raw) = tx.get(&rk)? {
        let postings: Vec<IndexEntry> = match serde_json::from_slice(&raw) {
            Ok(p) => p,
            Err(e) => return abort(StoreError::Corrupt { key: format!("{table}/{key}"), reason: e.to_string() }),
        };
        for ix in &postings { tx.remove(index_key(table, ix, key))?; }
        tx.remove(rk)?;
    }
    Ok(())
}

fn apply(tx: &TransactionalTree, batch: &WriteBatch) -> ConflictableTransactionResult<(), StoreError> {
    for guard in &batch.guards {
        match guard {
            Guard::Absent { table, key } => {
                if tx.get(data_key(table, key))?.is_some() { return abort(StoreError::PreconditionFailed(format!("{table}/{key}"))); }
            }
            Guard::Equals { table, key, value } => match tx.get(data_key(table, key))? {
                Some(current) if current.as_ref() == value.as_slice() => {}
                _ => return abort(StoreError::PreconditionFailed(format!("{table}/{key}"))),
            },
        }
    }
    for op in &batch.ops {
        match op {
            WriteOp::Put { table, key, value, indexes } => {
                drop_postings(tx, table, key)?;
                tx.insert(data_key(table, key), value.clone())?;
                if !indexes.is_empty() {
                    for ix in indexes { tx.insert(index_key(table, ix, key), key.as_bytes().to_vec())?; }
                    let postings = match serde_json::to_vec(indexes) {
                        Ok(p) => p,
                        Err(e) => return abort(StoreError::Corrupt { key: format!("{table}/{key}"), reason: e.to_string() }),
                    };
                    tx.insert(rev_key(table, key), postings)?;
                }
            }
            WriteOp::Delete { table, key } => {
                drop_postings(tx, table, key)?;
                tx.remove(data_key(table, key))?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl KvStore for SledStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(data_key(table, key))?.map(|v| v.to_vec()))
    }

    async fn scan(&self, table: &str, scan: Scan<'_>) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut table_prefix = join(&[b"d", table.as_bytes()]);
        table_prefix.push(SEP);
        let mut full_prefix = table_prefix.clone();
        full_prefix.extend_from_slice(scan.prefix.as_bytes());
        let lower = match scan.start_after {
            Some(after) => { let mut k = data_key(table, after); k.push(0); k.max(full_prefix.clone()) }
            None => full_prefix.clone(),
        };
        let limit = scan.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for kv in self.tree.range(lower..) {
            let (k, v) = kv?;
            if !k.starts_with(&full_prefix) || out.len() >= limit { break; }
            out.push((Self::decode_key(&k, table_prefix.len())?, v.to_vec()));
        }
        Ok(out)
    }

    async fn query_index(&self, table: &str, index: &str, value: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        for kv in self.tree.scan_prefix(index_prefix(table, index, value)) {
            let (_, primary) = kv?;
            let key = String::from_utf8(primary.to_vec()).map_err(|e| StoreError::Corrupt { key: format!("{table}#{index}"), reason: e.to_string() })?;
            // postings and records change in the same transaction; a miss means a concurrent delete
            if let Some(v) = self.tree.get(data_key(table, &key))? { out.push((key, v.to_vec())); }
        }
        Ok(out)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let res = self.tree.transaction(|tx| apply(tx, &batch));
        match res {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(e.into()),
        }
        self.tree.flush_async().await?;
        debug!(guards = batch.guards.len(), ops = batch.ops.len(), "batch_committed");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.tree.get(b"__ping__")?;
        if self.db.size_on_disk().is_err() { return Err(StoreError::Backend("size_on_disk unavailable".into())); }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_guard_blocks_second_create() {
        let store = SledStore::temporary().unwrap();
        let first = WriteBatch::new().require_absent("t", "a").put("t", "a", b"1".to_vec(), vec![]);
        store.commit(first.clone()).await.unwrap();
        let err = store.commit(first).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
        assert_eq!(store.get("t", "a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn equals_guard_detects_stale_read() {
        let store = SledStore::temporary().unwrap();
        store.commit(WriteBatch::new().put("t", "head", b"v1".to_vec(), vec![])).await.unwrap();
        store.commit(WriteBatch::new().require_equals("t", "head", b"v1".to_vec()).put("t", "head", b"v2".to_vec(), vec![])).await.unwrap();
        let stale = WriteBatch::new().require_equals("t", "head", b"v1".to_vec()).put("t", "head", b"v3".to_vec(), vec![]);
        assert!(matches!(store.commit(stale).await, Err(StoreError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn index_postings_follow_rewrites_and_deletes() {
        let store = SledStore::temporary().unwrap();
        store.commit(WriteBatch::new().put("m", "x/1", b"a".to_vec(), vec![IndexEntry::new("team", "fraud")])).await.unwrap();
        store.commit(WriteBatch::new().put("m", "y/1", b"b".to_vec(), vec![IndexEntry::new("team", "fraud")])).await.unwrap();
        assert_eq!(store.query_index("m", "team", "fraud").await.unwrap().len(), 2);
        store.commit(WriteBatch::new().put("m", "x/1", b"a2".to_vec(), vec![IndexEntry::new("team", "risk")])).await.unwrap();
        let fraud = store.query_index("m", "team", "fraud").await.unwrap();
        assert_eq!(fraud, vec![("y/1".to_string(), b"b".to_vec())]);
        store.commit(WriteBatch::new().delete("m", "y/1")).await.unwrap();
        assert!(store.query_index("m", "team", "fraud").await.unwrap().is_empty());
        assert_eq!(store.query_index("m", "team", "risk").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scan_respects_prefix_cursor_and_limit() {
        let store = SledStore::temporary().unwrap();
        for k in ["a/1", "a/2", "a/3", "b/1"] {
            store.commit(WriteBatch::new().put("m", k, k.as_bytes().to_vec(), vec![])).await.unwrap();
        }
        let all_a = store.scan("m", Scan::prefix("a/")).await.unwrap();
        assert_eq!(all_a.len(), 3);
        let page = store.scan("m", Scan { prefix: "", start_after: Some("a/2"), limit: Some(1) }).await.unwrap();
        assert_eq!(page[0].0, "a/3");
        assert_eq!(page.len(), 1);
        assert!(store.scan("other", Scan::prefix("")).await.unwrap().is_empty());
    }
}
