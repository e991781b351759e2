//! Insight scoring port trait.

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AlphaRuntimeStatistics {
    pub insights_generated: u64,
    pub insights_closed: u64,
    pub mean_population_score: f64,
}

pub trait AlphaPort: Send + Sync {
    fn process_synchronous_events(&self) -> anyhow::Result<()>;

    fn runtime_statistics(&self) -> AlphaRuntimeStatistics;
}
