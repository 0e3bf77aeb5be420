//! Primary validator loop.
//!
//! The primary owns three per-epoch duties, all driven by block height:
//!
//! - commit its lead decisions for the current epoch before the cutoff,
//! - reveal the previous epoch's decisions inside the reveal window,
//! - at the weight-submission offset, turn accumulated scores into weights,
//!   set them on chain and publish the signed bundle through the gateway.
//!
//! Weights go on chain before the bundle is submitted so the snapshot the
//! gateway captures at acceptance already reflects this epoch.

pub mod emission;

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sp_core::sr25519;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::canonical::constants::{BLOCK_TIME_SECS, DEFAULT_NETUID, event_types};
use crate::canonical::{
    Decision, EnvelopeError, SignedRequest, ValidationReveal, commit_validation,
    fixed16_to_float, generate_salt,
};
use crate::chain_client::{ChainClient, ChainError};
use crate::epoch::{
    BlockClock, ClockError, CutoffGuard, EpochAccumulator, EpochSchedule, PendingReveals,
    StateFileError,
};
use crate::gateway_client::{GatewayClient, GatewayClientError};
use crate::metrics::AuditorMetrics;
use crate::signer::{AttestationProvider, SignerError, WeightSigner};
use crate::types::{
    CommitAccepted, CommitPayload, RevealPayload, RevealRequest, SubmitAccepted, WeightSubmission,
};

pub use emission::{EmissionPolicy, ScoreWindow};

/// One scored lead, as handed over by the scoring pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeadValidation {
    pub lead_id: String,
    pub miner_hotkey: String,
    pub decision: Decision,
    pub rep_score: u32,
    pub rejection_reason: Value,
    /// Kept private by the gateway; only its hash is logged.
    pub evidence: Value,
}

#[derive(Debug, Error)]
pub enum PrimaryError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error(transparent)]
    Gateway(#[from] GatewayClientError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    State(#[from] StateFileError),
    #[error("request envelope: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("reveal payload could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("commit window for epoch {epoch_id} closed at block {cutoff_block}")]
    CommitWindowClosed { epoch_id: u64, cutoff_block: u64 },
}

impl PrimaryError {
    pub fn is_transient(&self) -> bool {
        match self {
            PrimaryError::Gateway(e) => e.is_transient(),
            PrimaryError::Chain(e) => e.is_transient(),
            PrimaryError::Clock(_) => true,
            PrimaryError::Signer(SignerError::NotInitialized) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PrimaryConfig {
    pub netuid: u64,
    /// Identifies the validator build in signed relay requests.
    pub build_id: String,
    pub poll_interval: Duration,
    /// Offset at which the epoch's buffered decisions are committed. Must
    /// not exceed the schedule's commit cutoff.
    pub commit_offset: u64,
    pub emission: EmissionPolicy,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            netuid: u64::from(DEFAULT_NETUID),
            build_id: env!("CARGO_PKG_VERSION").to_string(),
            poll_interval: Duration::from_secs(BLOCK_TIME_SECS),
            commit_offset: 330,
            emission: EmissionPolicy::default(),
        }
    }
}

/// Result of one epoch's weight submission.
#[derive(Clone, Debug)]
pub struct EpochSubmission {
    pub submission: WeightSubmission,
    /// `None` when the gateway refused or was unreachable; chain weights
    /// are set regardless.
    pub gateway: Option<SubmitAccepted>,
}

pub struct PrimaryValidator<C, G, P>
where
    C: ChainClient + ?Sized,
    G: GatewayClient + ?Sized,
    P: AttestationProvider,
{
    config: PrimaryConfig,
    schedule: EpochSchedule,
    chain: Arc<C>,
    clock: BlockClock<C>,
    gateway: Arc<G>,
    signer: WeightSigner<P>,
    hotkey: sr25519::Pair,
    accumulator: EpochAccumulator,
    pending: PendingReveals,
    buffered: BTreeMap<u64, VecDeque<LeadValidation>>,
    last_submitted: Option<u64>,
    metrics: Option<AuditorMetrics>,
}

impl<C, G, P> PrimaryValidator<C, G, P>
where
    C: ChainClient + ?Sized,
    G: GatewayClient + ?Sized,
    P: AttestationProvider,
{
    /// Loads persisted state from `state_dir` and initializes the enclave
    /// key if needed.
    pub fn new(
        config: PrimaryConfig,
        schedule: EpochSchedule,
        chain: Arc<C>,
        gateway: Arc<G>,
        signer: WeightSigner<P>,
        hotkey: sr25519::Pair,
        state_dir: &Path,
    ) -> Result<Self, PrimaryError> {
        let accumulator = EpochAccumulator::load(state_dir, schedule)?;
        let pending = PendingReveals::load(state_dir)?;
        if signer.enclave_pubkey().is_none() {
            let pubkey = signer.initialize();
            tracing::info!(enclave_pubkey = %pubkey, "enclave key initialized");
        }
        tracing::info!(
            epochs = accumulator.len(),
            pending_reveals = ?pending.epochs(),
            "primary state loaded"
        );
        Ok(Self {
            clock: BlockClock::new(chain.clone()),
            config,
            schedule,
            chain,
            gateway,
            signer,
            hotkey,
            accumulator,
            pending,
            buffered: BTreeMap::new(),
            last_submitted: None,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: AuditorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_clock(mut self, clock: BlockClock<C>) -> Self {
        self.clock = clock;
        self
    }

    pub fn accumulator(&self) -> &EpochAccumulator {
        &self.accumulator
    }

    pub fn pending_reveals(&self) -> &PendingReveals {
        &self.pending
    }

    /// Queues scored leads for the epoch containing `block`.
    pub fn buffer_validations(&mut self, block: u64, validations: Vec<LeadValidation>) {
        let epoch_id = self.schedule.epoch_of(block);
        self.buffered.entry(epoch_id).or_default().extend(validations);
    }

    /// Commits `validations` as the epoch's single batch, then persists the
    /// reveals and credits approved leads to the accumulator.
    pub async fn commit_validations(
        &mut self,
        epoch_id: u64,
        block: u64,
        validations: Vec<LeadValidation>,
    ) -> Result<CommitAccepted, PrimaryError> {
        let guard = CutoffGuard::new(&self.schedule, epoch_id);
        if !guard.may_start(block) {
            return Err(PrimaryError::CommitWindowClosed {
                epoch_id,
                cutoff_block: guard.cutoff_block(),
            });
        }

        // One salt per epoch, reused if this epoch already has reveals.
        let salt = self
            .pending
            .get(epoch_id)
            .and_then(|r| r.first())
            .map(|r| r.salt.clone())
            .unwrap_or_else(generate_salt);

        let mut reveals = Vec::with_capacity(validations.len());
        let mut commitments = Vec::with_capacity(validations.len());
        for v in &validations {
            let reveal = ValidationReveal {
                lead_id: v.lead_id.clone(),
                decision: v.decision,
                rep_score: v.rep_score,
                rejection_reason: v.rejection_reason.clone(),
                salt: salt.clone(),
            };
            commitments.push(commit_validation(&v.lead_id, &reveal, v.evidence.clone()));
            reveals.push(reveal);
        }

        let request = SignedRequest::sign(
            event_types::VALIDATION_COMMIT_BATCH,
            &self.hotkey,
            &self.config.build_id,
            CommitPayload {
                epoch_id,
                validations: commitments,
            },
        )?;
        let accepted = self.gateway.submit_commit(&request).await?;

        self.pending.add(epoch_id, reveals)?;
        self.accumulator.ensure_epoch(epoch_id)?;
        for v in validations.iter().filter(|v| v.decision == Decision::Approve) {
            self.accumulator
                .record_approved(epoch_id, &v.miner_hotkey, f64::from(v.rep_score))?;
        }
        tracing::info!(
            epoch_id,
            validations = accepted.validation_count,
            event_hash = %accepted.event_hash,
            "validation batch committed"
        );
        Ok(accepted)
    }

    /// Commits buffered decisions once their epoch reaches the commit
    /// offset. Buffers past their cutoff are abandoned.
    async fn flush_buffered(&mut self, block: u64) -> Result<(), PrimaryError> {
        let current = self.schedule.epoch_of(block);
        let offset = self.schedule.offset_in_epoch(block);
        let ready: Vec<u64> = self
            .buffered
            .keys()
            .copied()
            .filter(|e| *e < current || offset >= self.config.commit_offset)
            .collect();

        for epoch_id in ready {
            let Some(mut queue) = self.buffered.remove(&epoch_id) else {
                continue;
            };
            let guard = CutoffGuard::new(&self.schedule, epoch_id);
            let batch = guard.next_batch(&mut queue, usize::MAX, block);
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = self.commit_validations(epoch_id, block, batch.clone()).await {
                if e.is_transient() {
                    // Put the batch back; the next poll retries before the cutoff.
                    self.buffered.insert(epoch_id, batch.into());
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Reveals every epoch whose reveal window is open at `block`.
    pub async fn reveal_due(&mut self, block: u64) -> Result<Vec<u64>, PrimaryError> {
        let mut revealed = Vec::new();
        for epoch_id in self.pending.due(&self.schedule, block)? {
            let Some(reveals) = self.pending.get(epoch_id).map(<[_]>::to_vec) else {
                continue;
            };
            let request = RevealRequest::sign(
                &self.hotkey,
                RevealPayload {
                    epoch_id,
                    reveals,
                },
            )?;
            match self.gateway.submit_reveal(&request).await {
                Ok(accepted) => {
                    tracing::info!(
                        epoch_id,
                        reveals = accepted.reveal_count,
                        event_hash = %accepted.event_hash,
                        "reveals accepted"
                    );
                    self.pending.mark_revealed(epoch_id)?;
                    revealed.push(epoch_id);
                }
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    // A refused reveal will not succeed on retry.
                    tracing::error!(epoch_id, error = %e, "gateway refused reveals; dropping");
                    self.pending.mark_revealed(epoch_id)?;
                }
            }
        }
        Ok(revealed)
    }

    /// Computes, signs and submits weights for `epoch_id` at `block`.
    pub async fn submit_epoch_weights(
        &mut self,
        epoch_id: u64,
        block: u64,
    ) -> Result<EpochSubmission, PrimaryError> {
        let hotkeys = self.chain.metagraph_hotkeys(self.config.netuid).await?;
        let policy = &self.config.emission;

        let current = self
            .accumulator
            .epoch(epoch_id)
            .map(|e| ScoreWindow {
                scores: e.miner_scores.clone(),
                approved_leads: e.approved_lead_count,
            })
            .unwrap_or_default();
        let (scores, approved_leads) =
            self.accumulator.rolling_scores(epoch_id, policy.rolling_window);
        let rolling = ScoreWindow {
            scores,
            approved_leads,
        };
        let (uids, weights) = policy.compute(&current, &rolling, &hotkeys);

        let submission = self.signer.sign_epoch(epoch_id, block, &uids, &weights)?;

        // Exactly what the bundle commits to, so auditors compare like for like.
        let (chain_uids, chain_weights) = fixed16_to_float(&submission.pairs());
        self.chain
            .set_weights(self.config.netuid, &chain_uids, &chain_weights)
            .await?;
        self.last_submitted = Some(epoch_id);

        let gateway = match self.gateway.submit_weights(&submission).await {
            Ok(accepted) => {
                tracing::info!(
                    epoch_id,
                    event_hash = %accepted.weight_submission_event_hash,
                    "gateway accepted weight bundle"
                );
                Some(accepted)
            }
            Err(e) => {
                tracing::error!(epoch_id, error = %e, "gateway did not accept weight bundle");
                None
            }
        };
        if let Some(m) = &self.metrics {
            let outcome = if gateway.is_some() { "published" } else { "chain_only" };
            m.primary_submissions_total.with_label_values(&[outcome]).inc();
        }
        Ok(EpochSubmission {
            submission,
            gateway,
        })
    }

    /// One poll: commit, reveal, then submit weights when the window opens.
    pub async fn tick(&mut self) -> Result<(), PrimaryError> {
        let block = self.clock.current_block().await?;
        let epoch_id = self.schedule.epoch_of(block);

        self.flush_buffered(block).await?;
        self.reveal_due(block).await?;

        if self.schedule.in_weight_window(block) && self.last_submitted != Some(epoch_id) {
            self.submit_epoch_weights(epoch_id, block).await?;
        }
        Ok(())
    }

    /// Polls until `shutdown` flips, taking scored leads from `validations`.
    pub async fn run(
        &mut self,
        mut validations: mpsc::Receiver<Vec<LeadValidation>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PrimaryError> {
        let mut intake_open = true;
        loop {
            if let Err(e) = self.tick().await {
                if e.is_transient() {
                    tracing::warn!(error = %e, "primary cycle skipped");
                } else {
                    tracing::error!(error = %e, "primary cycle failed");
                }
            }

            let sleep = tokio::time::sleep(self.config.poll_interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    batch = validations.recv(), if intake_open => match batch {
                        Some(batch) => match self.clock.current_block().await {
                            Ok(block) => self.buffer_validations(block, batch),
                            Err(e) => tracing::warn!(error = %e, dropped = batch.len(), "no block height for scored leads"),
                        },
                        None => intake_open = false,
                    },
                    _ = shutdown.changed() => {
                        tracing::info!("primary shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auditor::test_support::{hotkey, signer};
    use crate::canonical::{bundle_hash, normalize_chain_weights, tolerant_equal, verify_reveal};
    use crate::chain_client::InMemoryChain;
    use crate::gateway_client::InMemoryGateway;
    use crate::signer::DevAttestationProvider;
    use serde_json::json;
    use sp_core::Pair;
    use sp_core::crypto::Ss58Codec;
    use tempfile::TempDir;

    const PRIMARY_UID: u32 = 1;

    type Primary = PrimaryValidator<InMemoryChain, InMemoryGateway, DevAttestationProvider>;

    fn setup(dir: &TempDir) -> (Arc<InMemoryChain>, Arc<InMemoryGateway>, Primary) {
        let chain = Arc::new(InMemoryChain::new(PRIMARY_UID));
        chain.set_hotkeys(
            71,
            vec![
                "owner".into(),
                hotkey().public().to_ss58check(),
                "miner-a".into(),
                "miner-b".into(),
            ],
        );
        let gateway = Arc::new(InMemoryGateway::new());
        let primary = PrimaryValidator::new(
            PrimaryConfig {
                netuid: 71,
                build_id: "test-build".into(),
                ..PrimaryConfig::default()
            },
            EpochSchedule::default(),
            chain.clone(),
            gateway.clone(),
            signer(),
            hotkey(),
            dir.path(),
        )
        .unwrap();
        (chain, gateway, primary)
    }

    fn lead(id: &str, miner: &str, decision: Decision, score: u32) -> LeadValidation {
        LeadValidation {
            lead_id: id.into(),
            miner_hotkey: miner.into(),
            decision,
            rep_score: score,
            rejection_reason: if decision == Decision::Approve {
                json!("pass")
            } else {
                json!({"message": "bad email"})
            },
            evidence: json!({"checks": [id]}),
        }
    }

    #[tokio::test]
    async fn commit_then_reveal_round() {
        let dir = TempDir::new().unwrap();
        let (_chain, gateway, mut primary) = setup(&dir);

        primary
            .commit_validations(
                100,
                36_100,
                vec![
                    lead("l1", "miner-a", Decision::Approve, 30),
                    lead("l2", "miner-b", Decision::Deny, 0),
                ],
            )
            .await
            .unwrap();

        let commits = gateway.commits();
        assert_eq!(commits.len(), 1);
        let commit = &commits[0];
        assert_eq!(commit.event_type, event_types::VALIDATION_COMMIT_BATCH);
        commit.verify_signature().unwrap();
        commit.verify_payload_hash().unwrap();
        assert_eq!(primary.accumulator().epoch(100).unwrap().approved_lead_count, 1);

        // Not yet revealable during epoch 100.
        assert!(primary.reveal_due(36_200).await.unwrap().is_empty());
        assert_eq!(primary.reveal_due(36_400).await.unwrap(), vec![100]);

        let reveals = gateway.reveals();
        assert_eq!(reveals.len(), 1);
        reveals[0].verify().unwrap();
        for (c, r) in commit.payload.validations.iter().zip(&reveals[0].payload.reveals) {
            verify_reveal(c, r).unwrap();
        }
        assert!(primary.pending_reveals().epochs().is_empty());
    }

    #[tokio::test]
    async fn commits_after_cutoff_are_refused() {
        let dir = TempDir::new().unwrap();
        let (_chain, gateway, mut primary) = setup(&dir);
        let err = primary
            .commit_validations(100, 36_355, vec![lead("l1", "miner-a", Decision::Approve, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, PrimaryError::CommitWindowClosed { cutoff_block: 36_355, .. }));
        assert!(gateway.commits().is_empty());
    }

    #[tokio::test]
    async fn weights_go_on_chain_and_to_the_gateway() {
        let dir = TempDir::new().unwrap();
        let (chain, gateway, mut primary) = setup(&dir);
        primary
            .commit_validations(99, 35_700, vec![lead("l1", "miner-a", Decision::Approve, 40)])
            .await
            .unwrap();

        let out = primary.submit_epoch_weights(100, 36_346).await.unwrap();
        assert!(out.gateway.is_some());
        let sub = &gateway.submissions()[0];
        assert_eq!(sub.weights_hash, bundle_hash(71, 100, 36_346, &sub.pairs()));
        assert_eq!(sub.uids, vec![0, 2]);

        let on_chain = normalize_chain_weights(&chain.weights(71, PRIMARY_UID).await.unwrap()).unwrap();
        assert!(tolerant_equal(&sub.pairs(), &on_chain, 1));
    }

    #[tokio::test]
    async fn no_history_burns_and_gateway_outage_does_not_block_chain() {
        let dir = TempDir::new().unwrap();
        let (chain, gateway, mut primary) = setup(&dir);
        gateway.set_unavailable(true);

        let out = primary.submit_epoch_weights(100, 36_346).await.unwrap();
        assert!(out.gateway.is_none());
        assert_eq!(out.submission.uids, vec![0]);
        let calls = chain.set_weights_calls();
        assert_eq!(calls[0].uids, vec![0]);
        assert_eq!(calls[0].weights, vec![1.0]);
    }

    #[tokio::test]
    async fn tick_commits_buffered_leads_and_submits_once() {
        let dir = TempDir::new().unwrap();
        let (chain, gateway, mut primary) = setup(&dir);

        primary.buffer_validations(36_010, vec![lead("l1", "miner-a", Decision::Approve, 12)]);
        chain.set_block(36_100);
        primary.tick().await.unwrap();
        assert!(gateway.commits().is_empty());

        chain.set_block(36_340);
        primary.tick().await.unwrap();
        assert_eq!(gateway.commits().len(), 1);

        chain.set_block(36_346);
        primary.tick().await.unwrap();
        primary.tick().await.unwrap();
        assert_eq!(chain.set_weights_calls().len(), 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (_chain, _gateway, mut primary) = setup(&dir);
            primary
                .commit_validations(100, 36_100, vec![lead("l1", "miner-a", Decision::Approve, 20)])
                .await
                .unwrap();
        }
        let (_chain, _gateway, primary) = setup(&dir);
        assert_eq!(primary.pending_reveals().epochs(), vec![100]);
        assert_eq!(primary.accumulator().epoch(100).unwrap().miner_scores["miner-a"], 20.0);
    }
}
