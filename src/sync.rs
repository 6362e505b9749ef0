/*
Optimistic list synchronizer.

A notification record can be visible in any number of cached list views
at once. A view is one of three shapes:

- Flat:    [record, ...]
- Wrapped: { items: [record, ...] }
- Paged:   { pages: [shape, ...], next_cursor }

A mutation is applied to every view before the store confirms it. On
store failure every touched view is put back: the exact pre-mutation
value when nothing else changed it meanwhile, otherwise the affected
records are patched back by id.
*/

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};

use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::NotificationRecord;
use crate::store::{NotificationPage, NotificationStore, ReadFilter};

type RecordFn<'a> = dyn FnMut(&NotificationRecord) -> Option<NotificationRecord> + 'a;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheShape {
    Flat(Arc<Vec<NotificationRecord>>),
    Wrapped {
        items: Arc<Vec<NotificationRecord>>,
    },
    Paged {
        pages: Arc<Vec<CacheShape>>,
        next_cursor: Option<usize>,
    },
}

impl CacheShape {
    pub fn flat(records: Vec<NotificationRecord>) -> Self {
        CacheShape::Flat(Arc::new(records))
    }

    pub fn wrapped(records: Vec<NotificationRecord>) -> Self {
        CacheShape::Wrapped {
            items: Arc::new(records),
        }
    }

    pub fn paged(pages: Vec<CacheShape>, next_cursor: Option<usize>) -> Self {
        CacheShape::Paged {
            pages: Arc::new(pages),
            next_cursor,
        }
    }

    // Apply `f` to every record. `f` returns the replacement, or None to
    // leave the record alone. Returns None when nothing changed so the
    // caller keeps the old value (and its identity).
    pub fn map_records(&self, f: &mut RecordFn<'_>) -> Option<CacheShape> {
        match self {
            CacheShape::Flat(list) => map_list(list, f).map(CacheShape::Flat),
            CacheShape::Wrapped { items } => {
                map_list(items, f).map(|items| CacheShape::Wrapped { items })
            }
            CacheShape::Paged { pages, next_cursor } => {
                let mut out: Option<Vec<CacheShape>> = None;
                for (i, page) in pages.iter().enumerate() {
                    if let Some(updated) = page.map_records(f) {
                        out.get_or_insert_with(|| pages.to_vec())[i] = updated;
                    }
                }
                out.map(|pages| CacheShape::Paged {
                    pages: Arc::new(pages),
                    next_cursor: *next_cursor,
                })
            }
        }
    }

    // Same container, not just equal contents.
    pub fn ptr_eq(&self, other: &CacheShape) -> bool {
        match (self, other) {
            (CacheShape::Flat(a), CacheShape::Flat(b)) => Arc::ptr_eq(a, b),
            (CacheShape::Wrapped { items: a }, CacheShape::Wrapped { items: b }) => {
                Arc::ptr_eq(a, b)
            }
            (
                CacheShape::Paged {
                    pages: a,
                    next_cursor: ca,
                },
                CacheShape::Paged {
                    pages: b,
                    next_cursor: cb,
                },
            ) => Arc::ptr_eq(a, b) && ca == cb,
            _ => false,
        }
    }

    // Flattened, in display order.
    pub fn records(&self) -> Vec<NotificationRecord> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(&self, out: &mut Vec<NotificationRecord>) {
        match self {
            CacheShape::Flat(list) | CacheShape::Wrapped { items: list } => {
                out.extend(list.iter().cloned())
            }
            CacheShape::Paged { pages, .. } => {
                for page in pages.iter() {
                    page.collect_into(out);
                }
            }
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        match self {
            CacheShape::Flat(list) | CacheShape::Wrapped { items: list } => {
                list.iter().any(|r| r.id == id)
            }
            CacheShape::Paged { pages, .. } => pages.iter().any(|p| p.contains(id)),
        }
    }
}

fn map_list(
    list: &Arc<Vec<NotificationRecord>>,
    f: &mut RecordFn<'_>,
) -> Option<Arc<Vec<NotificationRecord>>> {
    let mut out: Option<Vec<NotificationRecord>> = None;
    for (i, record) in list.iter().enumerate() {
        if let Some(updated) = f(record) {
            if updated != *record {
                out.get_or_insert_with(|| list.to_vec())[i] = updated;
            }
        }
    }
    out.map(Arc::new)
}

// One view touched by a mutation.
#[derive(Debug, Clone)]
pub struct ViewChange {
    pub key: String,
    pub before: CacheShape,
    pub after: CacheShape,
}

// ----------------------------------------------------------------------------
// Multi-view cache
// ----------------------------------------------------------------------------

// Named views of the notification feed. Consumers subscribe to view keys
// to learn when a view was replaced.
pub struct MultiViewCache {
    views: StdRwLock<BTreeMap<String, CacheShape>>,
    changes: broadcast::Sender<String>,
}

impl Default for MultiViewCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiViewCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            views: StdRwLock::new(BTreeMap::new()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    pub fn put(&self, key: impl Into<String>, shape: CacheShape) {
        let key = key.into();
        self.views
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), shape);
        self.publish(key);
    }

    pub fn get(&self, key: &str) -> Option<CacheShape> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    // Apply `f` across every view; returns the views that actually changed.
    pub fn apply(&self, f: &mut RecordFn<'_>) -> Vec<ViewChange> {
        let mut changes = Vec::new();
        {
            let mut views = self.views.write().unwrap_or_else(PoisonError::into_inner);
            for (key, shape) in views.iter_mut() {
                if let Some(updated) = shape.map_records(f) {
                    let before = std::mem::replace(shape, updated.clone());
                    changes.push(ViewChange {
                        key: key.clone(),
                        before,
                        after: updated,
                    });
                }
            }
        }
        for change in &changes {
            self.publish(change.key.clone());
        }
        changes
    }

    pub fn rollback(&self, changes: Vec<ViewChange>) {
        let mut touched = Vec::with_capacity(changes.len());
        {
            let mut views = self.views.write().unwrap_or_else(PoisonError::into_inner);
            for change in changes {
                let Some(current) = views.get_mut(&change.key) else {
                    continue;
                };
                if current.ptr_eq(&change.after) {
                    *current = change.before;
                } else if let Some(patched) = patch_back(current, &change) {
                    *current = patched;
                }
                touched.push(change.key);
            }
        }
        for key in touched {
            self.publish(key);
        }
    }

    fn publish(&self, key: String) {
        // no subscribers is fine
        let _ = self.changes.send(key);
    }
}

// The view was replaced after the mutation (a page load, say). Put back
// only the records this change touched.
fn patch_back(current: &CacheShape, change: &ViewChange) -> Option<CacheShape> {
    let originals: HashMap<Uuid, NotificationRecord> = change
        .before
        .records()
        .into_iter()
        .map(|r| (r.id, r))
        .collect();
    let touched: HashSet<Uuid> = change
        .after
        .records()
        .into_iter()
        .filter(|r| originals.get(&r.id) != Some(r))
        .map(|r| r.id)
        .collect();
    current.map_records(&mut |r| {
        if touched.contains(&r.id) {
            originals.get(&r.id).cloned()
        } else {
            None
        }
    })
}

// ----------------------------------------------------------------------------
// Optimistic synchronizer
// ----------------------------------------------------------------------------

pub struct OptimisticSync {
    views: Arc<MultiViewCache>,
    store: Arc<dyn NotificationStore>,
    record_locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    // single-record updates share it; mark-all takes it exclusively
    bulk: RwLock<()>,
}

impl OptimisticSync {
    pub fn new(views: Arc<MultiViewCache>, store: Arc<dyn NotificationStore>) -> Self {
        Self {
            views,
            store,
            record_locks: StdMutex::new(HashMap::new()),
            bulk: RwLock::new(()),
        }
    }

    pub fn views(&self) -> &Arc<MultiViewCache> {
        &self.views
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self
            .record_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }

    // Forget the record's lock once nobody else holds or waits on it.
    fn release_lock(&self, id: Uuid) {
        let mut locks = self
            .record_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&id);
        }
    }

    // Snapshot, apply to every view, persist; roll back on failure.
    //
    // Mutations of the same record are serialized from snapshot until
    // commit or rollback.
    pub async fn update_record<F, Fut>(&self, id: Uuid, update: F, persist: Fut) -> Result<()>
    where
        F: Fn(&NotificationRecord) -> NotificationRecord,
        Fut: Future<Output = Result<()>>,
    {
        let _bulk = self.bulk.read().await;
        let lock = self.lock_for(id);
        let outcome = {
            let _guard = lock.lock().await;
            let changes = self.views.apply(&mut |r| (r.id == id).then(|| update(r)));
            match persist.await {
                Ok(()) => {
                    debug!(%id, views = changes.len(), "optimistic update confirmed");
                    Ok(())
                }
                Err(e) => {
                    warn!(
                        %id,
                        views = changes.len(),
                        error = %e,
                        "store rejected update, rolling back"
                    );
                    self.views.rollback(changes);
                    Err(e)
                }
            }
        };
        drop(lock);
        self.release_lock(id);
        outcome
    }

    pub async fn mark_read(&self, id: Uuid, is_read: bool) -> Result<()> {
        let store = Arc::clone(&self.store);
        self.update_record(
            id,
            |r| NotificationRecord {
                is_read,
                ..r.clone()
            },
            async move { store.set_read(id, is_read).await },
        )
        .await
    }

    // Same protocol, applied to every unread record of the user.
    pub async fn mark_all_read(&self, user_id: &str) -> Result<()> {
        let _bulk = self.bulk.write().await;

        let changes = self.views.apply(&mut |r| {
            (r.user_id == user_id && !r.is_read).then(|| NotificationRecord {
                is_read: true,
                ..r.clone()
            })
        });
        match self.store.set_all_read(user_id).await {
            Ok(()) => {
                debug!(user_id, views = changes.len(), "mark all read confirmed");
                Ok(())
            }
            Err(e) => {
                warn!(
                    user_id,
                    views = changes.len(),
                    error = %e,
                    "store rejected mark all read, rolling back"
                );
                self.views.rollback(changes);
                Err(e)
            }
        }
    }

    // Infinite scroll. A first page (no cursor) resets the view; later
    // pages are appended.
    pub async fn load_page(
        &self,
        view_key: &str,
        user_id: &str,
        cursor: Option<usize>,
        page_size: usize,
        read: ReadFilter,
    ) -> Result<NotificationPage> {
        let page = self
            .store
            .fetch_notifications(user_id, cursor, page_size, read)
            .await?;

        let fresh = CacheShape::flat(page.items.clone());
        let shape = match (cursor, self.views.get(view_key)) {
            (Some(_), Some(CacheShape::Paged { pages, .. })) => {
                let mut pages = pages.to_vec();
                pages.push(fresh);
                CacheShape::paged(pages, page.next_cursor)
            }
            _ => CacheShape::paged(vec![fresh], page.next_cursor),
        };
        self.views.put(view_key, shape);
        debug!(view_key, items = page.items.len(), next_cursor = ?page.next_cursor, "page loaded");
        Ok(page)
    }
}
