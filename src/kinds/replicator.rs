// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator items: one-shot replication from `source` to `target`.

use std::sync::Arc;

use tracing::debug;

use crate::engine::ItemAction;
use crate::item::{Item, ItemType, ReplicatorSpec};
use crate::store::BoxFuture;

/// Runs a replication.
///
/// Should fail with `TargetNotFound` when the source database is gone.
pub trait ReplicationClient: Send + Sync + 'static {
    fn replicate<'a>(&'a self, spec: &'a ReplicatorSpec) -> BoxFuture<'a, ()>;
}

/// Process action for replicator items.
///
/// A replication catches up completely, so the item is always left clean.
/// Replicators are configured by users and never synthesized.
pub struct ReplicatorAction {
    client: Arc<dyn ReplicationClient>,
}

impl ReplicatorAction {
    pub fn new(client: Arc<dyn ReplicationClient>) -> Self {
        Self { client }
    }
}

impl ItemAction for ReplicatorAction {
    fn item_type(&self) -> ItemType {
        ItemType::Replicator
    }

    fn process<'a>(&'a self, item: &'a mut Item) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let spec = item.replicator_spec()?;
            debug!(id = %item.id, source = %spec.source, target = %spec.target, "Replicating");
            self.client.replicate(&spec).await?;
            Ok(false)
        })
    }
}
