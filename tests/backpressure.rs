//! Backpressure: a slow embedder bounds throughput but loses no events.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use skilld::embed::{Embedder, StaticEmbedder};
use skilld::error::KernelResult;
use skilld::index::indexer::{spawn_worker, IndexOp, Indexer};
use skilld::index::RoutingStore;

const MANIFEST: &str = r#"---
name: bulk
description: Bulk skill
metadata:
  version: 0.1.0
  routing_keywords: [bulk]
---
# Bulk
"#;

/// Embedder that answers after a fixed delay, counting batches.
struct SlowEmbedder {
    inner: StaticEmbedder,
    delay: Duration,
    batches: AtomicUsize,
}

impl Embedder for SlowEmbedder {
    fn embed_batch(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
        std::thread::sleep(self.delay);
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.inner.embed_batch(texts)
    }

    fn dimension(&self) -> Option<usize> {
        self.inner.dimension()
    }
}

fn write_script(root: &Path, i: usize) -> std::path::PathBuf {
    let path = root.join(format!("bulk/scripts/cmd_{i:03}.py"));
    std::fs::write(
        &path,
        format!(
            "@skill_command(category=\"bulk\", description=\"Command {i}\")\ndef cmd_{i:03}():\n    pass\n"
        ),
    )
    .unwrap();
    path
}

#[tokio::test]
async fn burst_of_changes_is_delayed_never_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("bulk/scripts")).unwrap();
    std::fs::write(tmp.path().join("bulk/SKILL.md"), MANIFEST).unwrap();

    let embedder = Arc::new(SlowEmbedder {
        inner: StaticEmbedder::new(32),
        delay: Duration::from_millis(20),
        batches: AtomicUsize::new(0),
    });
    let indexer = Arc::new(Indexer::new(
        Arc::new(RoutingStore::in_memory().unwrap()),
        embedder.clone(),
        None,
        tmp.path().to_path_buf(),
    ));

    // A deliberately small queue so the burst overruns the high-water mark.
    let (tx, handle) = spawn_worker(Arc::clone(&indexer), 4);

    const CHANGES: usize = 40;
    for i in 0..CHANGES {
        let path = write_script(tmp.path(), i);
        // send() awaits when the queue is full: the producer is delayed,
        // the event is never dropped.
        tx.send(IndexOp::Index(path)).await.unwrap();
    }
    drop(tx);
    handle.await.unwrap();

    // Every change landed exactly once.
    let ids = indexer.store().all_ids().unwrap();
    assert_eq!(ids.len(), CHANGES);
    assert_eq!(embedder.batches.load(Ordering::SeqCst), CHANGES);
    for i in 0..CHANGES {
        assert!(ids.contains(&format!("bulk.cmd_{i:03}")));
    }
}
