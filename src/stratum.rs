/// Stratum seam
///
/// The miner-facing protocol server is an external collaborator. The
/// coordinator contract is one call: `on_block` must deliver fresh work to
/// every connected miner before returning, so two consecutive template
/// rebuilds can never interleave their fan-outs.

use tokio::sync::broadcast;

use crate::template::BlockTemplate;
use crate::types::Difficulty;

pub trait StratumServer: Send + Sync {
    fn on_block(&self, template: &dyn BlockTemplate);
}

/// One unit of work as fanned out to miner connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub template_id: u32,
    pub height: u64,
    pub difficulty: Difficulty,
}

/// Broadcast fan-out to miner connection tasks.
pub struct JobFeed {
    jobs: broadcast::Sender<Job>,
}

impl JobFeed {
    const CHANNEL_CAPACITY: usize = 64;

    pub fn new() -> Self {
        let (jobs, _) = broadcast::channel(Self::CHANNEL_CAPACITY);
        Self { jobs }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.jobs.subscribe()
    }

    pub fn miner_count(&self) -> usize {
        self.jobs.receiver_count()
    }
}

impl Default for JobFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl StratumServer for JobFeed {
    fn on_block(&self, template: &dyn BlockTemplate) {
        let job = Job {
            template_id: template.current_template_id(),
            height: template.height(),
            difficulty: template.difficulty(),
        };
        // send fails only with zero subscribers, which is fine
        let delivered = self.jobs.send(job).unwrap_or(0);
        tracing::debug!(
            "new job fanned out to {} miner connections",
            delivered
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::Mempool;
    use crate::template::PoolBlockTemplate;
    use crate::types::{MinerData, NetworkType};
    use crate::wallet::WalletAddress;

    #[tokio::test]
    async fn on_block_reaches_subscribers() {
        let tpl = PoolBlockTemplate::new([1; 32]);
        let wallet = WalletAddress::new(NetworkType::Mainnet, [1; 32], [2; 32]);
        let pool = Mempool::new();
        tpl.update(
            &MinerData {
                height: 123,
                ..Default::default()
            },
            &pool,
            &wallet,
        );

        let feed = JobFeed::new();
        let mut rx = feed.subscribe();
        feed.on_block(&tpl);

        let job = rx.recv().await.unwrap();
        assert_eq!(job.height, 123);
        assert_eq!(job.template_id, tpl.current_template_id());
    }
}
