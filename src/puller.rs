//! Pulls message bundles off the bus and feeds the pipeline.
//!
//! One durable pull consumer with explicit acks. Deliveries are acked as
//! soon as they are decoded — a poison payload must not be redelivered
//! forever — and the bounded forward into the dedup queue is what slows
//! the puller (and therefore the bus) when the pipeline is busy. A small
//! max-outstanding on the consumer bounds in-flight memory on top of
//! that.
//!
//! Stream errors tear the whole client down and rebuild it under
//! exponential backoff; the bus client is better at resuming from
//! scratch than from a wedged connection.

use std::collections::HashSet;

use anyhow::{Context as _, Result};
use async_nats::jetstream::{
    self,
    consumer::{AckPolicy, pull::Config as PullConfig},
};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bundle;
use crate::message::CompositeMessage;
use crate::tuning::{BACKOFF_BASE, BACKOFF_CAP, MAX_OUTSTANDING_DELIVERIES};
use crate::vitals::VitalsEvent;

pub struct PullerConfig {
    pub nats_url: String,
    /// Stream (topic) the bundles are published on; also the subject.
    pub stream: String,
    /// Durable consumer (subscription) name. Dry-run appends `-DEV`.
    pub subscription: String,
    pub dry_run: bool,
    /// Receivers whose bundles are silently dropped.
    pub blacklist: HashSet<String>,
}

impl PullerConfig {
    fn durable_name(&self) -> String {
        if self.dry_run {
            format!("{}-DEV", self.subscription)
        } else {
            self.subscription.clone()
        }
    }
}

enum SessionEnd {
    Cancelled,
    DownstreamClosed,
}

pub struct PubsubPuller {
    config: PullerConfig,
    outbound: mpsc::Sender<Vec<CompositeMessage>>,
    vitals: mpsc::Sender<VitalsEvent>,
    cancel: CancellationToken,
}

impl PubsubPuller {
    pub fn new(
        config: PullerConfig,
        outbound: mpsc::Sender<Vec<CompositeMessage>>,
        vitals: mpsc::Sender<VitalsEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            outbound,
            vitals,
            cancel,
        }
    }

    pub async fn run(self) {
        let durable = self.config.durable_name();
        info!(
            "puller starting: stream '{}', subscription '{}'",
            self.config.stream, durable
        );

        let mut backoff = BACKOFF_BASE;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.pull_session(&durable).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::DownstreamClosed) => {
                    warn!("puller: dedup queue closed, exiting");
                    break;
                }
                Err(e) => {
                    error!(
                        "puller: session failed ({e:#}); reconnecting in {:?}",
                        backoff
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }

        if self.config.dry_run {
            // A dry-run subscription is disposable; clean it off the bus.
            if let Err(e) = self.delete_subscription(&durable).await {
                warn!("puller: could not delete dry-run subscription '{durable}': {e:#}");
            }
        }
        info!("puller clean exit");
    }

    async fn connect(&self) -> Result<jetstream::stream::Stream> {
        let client = async_nats::ConnectOptions::new()
            .name("skymux-consolidator")
            .connect(&self.config.nats_url)
            .await
            .context("connecting to bus")?;
        let js = jetstream::new(client);

        js.get_or_create_stream(jetstream::stream::Config {
            name: self.config.stream.clone(),
            subjects: vec![self.config.stream.clone()],
            ..Default::default()
        })
        .await
        .map_err(|e| anyhow::anyhow!("ensuring stream '{}': {e}", self.config.stream))
    }

    async fn pull_session(&self, durable: &str) -> Result<SessionEnd> {
        let stream = self.connect().await?;

        let consumer_config = PullConfig {
            durable_name: Some(durable.to_string()),
            ack_policy: AckPolicy::Explicit,
            filter_subject: self.config.stream.clone(),
            max_ack_pending: MAX_OUTSTANDING_DELIVERIES,
            ..Default::default()
        };

        let consumer = if self.config.dry_run {
            // Recreate from scratch so a dry run never inherits a backlog.
            let _ = stream.delete_consumer(durable).await;
            stream
                .create_consumer(consumer_config)
                .await
                .map_err(|e| anyhow::anyhow!("creating consumer '{durable}': {e}"))?
        } else {
            stream
                .get_or_create_consumer(durable, consumer_config)
                .await
                .map_err(|e| anyhow::anyhow!("ensuring consumer '{durable}': {e}"))?
        };

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| anyhow::anyhow!("opening message stream: {e}"))?;

        info!("now pulling from '{durable}'");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                next = messages.next() => match next {
                    None => anyhow::bail!("message stream ended"),
                    Some(Err(e)) => anyhow::bail!("receiving delivery: {e}"),
                    Some(Ok(delivery)) => {
                        if !self.handle_delivery(delivery).await {
                            return Ok(SessionEnd::DownstreamClosed);
                        }
                    }
                }
            }
        }
    }

    /// Decode, ack, filter, forward. Returns false when the pipeline has
    /// shut down under us.
    async fn handle_delivery(&self, delivery: jetstream::Message) -> bool {
        let decoded = bundle::decode(&delivery.payload);

        // Ack regardless of decode outcome; redelivering a bad payload
        // would just fail again.
        if let Err(e) = delivery.ack().await {
            warn!("puller: ack failed: {e}");
        }

        let msgs = match decoded {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!("puller: dropping undecodable bundle: {e:#}");
                return true;
            }
        };
        let Some(last) = msgs.last() else {
            return true;
        };

        let receiver = msgs[0].receiver.clone();
        if self.config.blacklist.contains(&receiver) {
            return true;
        }

        let _ = self
            .vitals
            .send(VitalsEvent::Bundle {
                receiver,
                messages: msgs.len() as u64,
                last_message: last.generated_at,
            })
            .await;

        self.outbound.send(msgs).await.is_ok()
    }

    async fn delete_subscription(&self, durable: &str) -> Result<()> {
        let stream = self.connect().await?;
        stream
            .delete_consumer(durable)
            .await
            .map_err(|e| anyhow::anyhow!("deleting consumer '{durable}': {e}"))?;
        Ok(())
    }
}
