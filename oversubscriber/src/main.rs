use std::{
    env,
    future,
    io,
    pin::{Pin, pin},
};

use log::{info, warn};
use tokio::signal;

use oversubscriber::{Session, SessionConfig, SessionHandle, config::ShardConfig};

/// Polls `stop` once without waiting on it.
///
/// # Returns
/// Whether `stop` already fired.
async fn stopped<F>(stop: Pin<&mut F>) -> io::Result<bool>
where
    F: Future<Output = io::Result<()>>,
{
    tokio::select! {
        biased;
        res = stop => res.map(|_| true),
        _ = future::ready(()) => Ok(false),
    }
}

/// Swaps the working set over every shard of the dataset, in order.
///
/// `stop` is checked before each shard, the walk ends early once it fires.
///
/// # Returns
/// The amount of shards walked.
async fn walk<F>(
    handle: &SessionHandle,
    dataset: &[ShardConfig],
    mut stop: Pin<&mut F>,
) -> io::Result<usize>
where
    F: Future<Output = io::Result<()>>,
{
    for (i, shard) in dataset.iter().enumerate() {
        if stopped(stop.as_mut()).await? {
            warn!(shard = i; "interrupted, checkpointing before exit");
            return Ok(i);
        }

        let report = handle.update(shard.keyset.clone()).await?;
        let usage = handle.memory_usage().await;

        info!(
            shard = i,
            source:? = shard.source,
            admitted = report.admitted,
            flushed = report.flushed,
            resident_rows = usage.resident_rows,
            capacity = usage.capacity;
            "shard ready"
        );
    }

    Ok(dataset.len())
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args().nth(1).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "usage: oversubscriber <config.json>")
    })?;

    let config = SessionConfig::from_file(&path)?;
    let dataset = config.dataset.clone();
    let handle = SessionHandle::new(Session::open(config)?);
    info!("session opened from {path}, {} shards to go", dataset.len());

    // The first poll installs the handler, every shard swap after it can be interrupted.
    let ctrl_c = pin!(signal::ctrl_c());
    let walked = walk(&handle, &dataset, ctrl_c).await;

    let checkpoint = handle.shutdown().await?;
    info!("checkpoint written to {}", checkpoint.display());

    walked.map(|shards| info!(shards = shards; "dataset walked"))
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use oversubscriber::config::StoreConfig;

    use super::*;

    fn setup(root: &Path) -> (SessionHandle, Vec<ShardConfig>) {
        let dataset: Vec<ShardConfig> = [[1, 2], [2, 3]]
            .iter()
            .enumerate()
            .map(|(i, keys)| {
                let keyset = root.join(format!("shard.{i}.keyset"));
                fs::write(&keyset, format!("{}\n{}\n", keys[0], keys[1])).unwrap();
                ShardConfig {
                    source: root.join(format!("shard.{i}.data")),
                    keyset,
                }
            })
            .collect();

        let json = format!(
            r#"{{
                "table": {{ "name": "embeddings", "embedding_dim": 2, "capacity": 2 }},
                "checkpoint_dir": {:?},
                "optimizer": {{ "gradient_descent": {{ "learning_rate": 0.1 }} }}
            }}"#,
            root.join("ckpt")
        );

        let mut config = SessionConfig::from_json(&json).unwrap();
        config.store = StoreConfig::Memory;
        let session = Session::open(config).unwrap();

        (SessionHandle::new(session), dataset)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn walk_visits_every_shard() {
        let root = tempfile::tempdir().unwrap();
        let (handle, dataset) = setup(root.path());

        let stop = pin!(future::pending::<io::Result<()>>());
        assert_eq!(walk(&handle, &dataset, stop).await.unwrap(), 2);
        assert_eq!(handle.memory_usage().await.resident_rows, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn walk_stops_once_interrupted() {
        let root = tempfile::tempdir().unwrap();
        let (handle, dataset) = setup(root.path());

        let stop = pin!(future::ready(Ok(())));
        assert_eq!(walk(&handle, &dataset, stop).await.unwrap(), 0);
        assert_eq!(handle.memory_usage().await.resident_rows, 0);

        let checkpoint = handle.shutdown().await.unwrap();
        assert!(checkpoint.exists());
    }
}
