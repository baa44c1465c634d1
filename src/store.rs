use indexmap::IndexMap;

use crate::model::ScenarioResult;

/// Append-only record of the results streamed during one session.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    results: Vec<ScenarioResult>,
}

/// Results sharing one cycle number, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleGroup<'a> {
    pub cycle: u32,
    pub results: Vec<&'a ScenarioResult>,
}

impl CycleGroup<'_> {
    #[must_use]
    pub fn pass_rate(&self) -> f64 {
        pass_rate(self.results.iter().copied())
    }

    #[must_use]
    pub fn average_score(&self) -> f64 {
        average_score(self.results.iter().copied())
    }

    #[must_use]
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|result| result.passed).count()
    }
}

impl ResultStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, result: ScenarioResult) {
        self.results.push(result);
    }

    #[must_use]
    pub fn all(&self) -> &[ScenarioResult] {
        &self.results
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    /// Cycles in order of first appearance, each with its results.
    #[must_use]
    pub fn grouped_by_cycle(&self) -> Vec<CycleGroup<'_>> {
        group_by_cycle(&self.results)
    }

    /// Fraction of results that passed; `0.0` for an empty store.
    #[must_use]
    pub fn pass_rate(&self) -> f64 {
        pass_rate(self.results.iter())
    }

    #[must_use]
    pub fn average_score(&self) -> f64 {
        average_score(self.results.iter())
    }

    /// Cycle of the most recently appended result, not the highest seen.
    #[must_use]
    pub fn latest_cycle(&self) -> Option<u32> {
        self.results.last().map(|result| result.cycle)
    }
}

/// Group any ordered slice of results by cycle, keeping first-seen order.
#[must_use]
pub fn group_by_cycle(results: &[ScenarioResult]) -> Vec<CycleGroup<'_>> {
    let mut groups: IndexMap<u32, Vec<&ScenarioResult>> = IndexMap::new();
    for result in results {
        groups.entry(result.cycle).or_default().push(result);
    }
    groups
        .into_iter()
        .map(|(cycle, results)| CycleGroup { cycle, results })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn pass_rate<'a>(results: impl Iterator<Item = &'a ScenarioResult>) -> f64 {
    let (passed, total) = results.fold((0usize, 0usize), |(passed, total), result| {
        (passed + usize::from(result.passed), total + 1)
    });
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64
    }
}

#[allow(clippy::cast_precision_loss)]
fn average_score<'a>(results: impl Iterator<Item = &'a ScenarioResult>) -> f64 {
    let (sum, total) = results.fold((0.0, 0usize), |(sum, total), result| {
        (sum + result.score, total + 1)
    });
    if total == 0 { 0.0 } else { sum / total as f64 }
}
