use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::{AggregatorError, AggregatorOptions, SegmentAggregator};
use crate::cleanup::{CleanerOptions, RetentionCleaner};
use crate::config::Config;
use crate::merge::FfmpegConcat;
use crate::probe::Ffprobe;
use crate::recorder::{RecordingSupervisor, SupervisorOptions};

/// Owns every background component built from one `Config`
pub struct Manager {
    supervisors: Vec<RecordingSupervisor>,
    aggregators: Vec<SegmentAggregator>,
    cleaner: RetentionCleaner,
    running: bool,
}

impl Manager {
    /// Build one supervisor and one aggregator per stream, plus the cleaner.
    /// Creates each stream's `merged` directory.
    pub fn new(config: &Config) -> Result<Self, AggregatorError> {
        let supervisor_options = SupervisorOptions::from_config(config);
        let aggregator_options = AggregatorOptions::from_config(config);

        let probe = Arc::new(Ffprobe::new(
            config.aggregator.probe_program.clone(),
            Duration::from_secs(config.aggregator.probe_timeout),
        ));
        let merger = Arc::new(FfmpegConcat::new(
            config.aggregator.merge_program.clone(),
            config.recording.file_format.clone(),
            Duration::from_secs(config.aggregator.merge_timeout),
            Duration::from_millis(config.aggregator.settle_delay_ms),
        ));

        let mut supervisors = Vec::with_capacity(config.streams.len());
        let mut aggregators = Vec::with_capacity(config.streams.len());

        for stream in &config.streams {
            tracing::info!(stream = %stream.name, output = %stream.output_dir.display(), "configured stream");

            supervisors.push(RecordingSupervisor::new(stream.clone(), supervisor_options.clone()));

            if config.aggregator.enabled {
                aggregators.push(SegmentAggregator::new(
                    stream.name.clone(),
                    stream.segments_dir(),
                    stream.merged_dir(),
                    aggregator_options.clone(),
                    probe.clone(),
                    merger.clone(),
                )?);
            }
        }

        let cleaner = RetentionCleaner::new(
            config.streams.iter().map(|s| s.output_dir.clone()).collect(),
            CleanerOptions::from_config(config),
        );

        Ok(Self {
            supervisors,
            aggregators,
            cleaner,
            running: false,
        })
    }

    pub fn start(&mut self) {
        if self.running {
            tracing::warn!("manager already running");
            return;
        }

        tracing::info!(streams = self.supervisors.len(), "starting recording");
        for supervisor in &mut self.supervisors {
            supervisor.start();
        }

        if self.aggregators.is_empty() {
            tracing::info!("segment aggregation disabled");
        }
        for aggregator in &mut self.aggregators {
            aggregator.start();
        }

        self.cleaner.start();
        self.running = true;
        tracing::info!("all components started");
    }

    /// Stop recorders first so no new segments appear while aggregators
    /// finish their cycle, then the cleaner
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        tracing::info!("shutting down");

        for supervisor in &mut self.supervisors {
            supervisor.stop().await;
        }
        for aggregator in &mut self.aggregators {
            aggregator.stop().await;
        }
        self.cleaner.stop().await;

        self.running = false;
        tracing::info!("shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn supervisors(&self) -> &[RecordingSupervisor] {
        &self.supervisors
    }

    pub fn aggregators(&self) -> &[SegmentAggregator] {
        &self.aggregators
    }
}
