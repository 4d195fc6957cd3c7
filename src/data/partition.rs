//! Client partitioning
//!
//! Records are split into two groups by a feature rule (Adult: `workclass == 1`,
//! COMPAS: `age <= 31`). Each group is shuffled and cut into equal shards, one
//! per client, so clients `0..k` come from the first group and `k..2k` from the
//! second.

use super::{ClientPartition, Dataset, Record};
use crate::{FairHnError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Test applied to one feature value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GroupPredicate {
    Equals(f32),
    AtMost(f32),
}

/// Feature rule that decides which group a record belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRule {
    pub column: String,
    pub predicate: GroupPredicate,
}

impl GroupRule {
    pub fn equals(column: impl Into<String>, value: f32) -> Self {
        Self {
            column: column.into(),
            predicate: GroupPredicate::Equals(value),
        }
    }

    pub fn at_most(column: impl Into<String>, value: f32) -> Self {
        Self {
            column: column.into(),
            predicate: GroupPredicate::AtMost(value),
        }
    }

    pub fn matches(&self, value: f32) -> bool {
        match self.predicate {
            GroupPredicate::Equals(v) => value == v,
            GroupPredicate::AtMost(v) => value <= v,
        }
    }

    /// Split records into (matching, non-matching)
    pub fn split(&self, dataset: &Dataset) -> Result<(Vec<Record>, Vec<Record>)> {
        let idx = dataset
            .feature_names
            .iter()
            .position(|c| *c == self.column)
            .ok_or_else(|| {
                FairHnError::Data(format!("group column '{}' not among features", self.column))
            })?;

        Ok(dataset
            .records
            .iter()
            .cloned()
            .partition(|r| self.matches(r.features[idx])))
    }
}

/// Cut `records` into `shards` contiguous pieces; the last takes the remainder
fn shard(records: Vec<Record>, shards: usize) -> Vec<Vec<Record>> {
    let size = records.len() / shards;
    let mut out = Vec::with_capacity(shards);
    let mut rest = records;
    for _ in 0..shards - 1 {
        let tail = rest.split_off(size.min(rest.len()));
        out.push(rest);
        rest = tail;
    }
    out.push(rest);
    out
}

/// Build `num_clients` partitions from a train set and an optional test set
///
/// `num_clients` must be even: half the clients come from each group. Without
/// a test set, `holdout_per_group` shuffled records of each train group are
/// held out first.
pub fn build_client_partitions(
    train: &Dataset,
    test: Option<&Dataset>,
    rule: &GroupRule,
    num_clients: usize,
    holdout_per_group: usize,
    rng: &mut StdRng,
) -> Result<Vec<ClientPartition>> {
    if num_clients < 2 || num_clients % 2 != 0 {
        return Err(FairHnError::Config(format!(
            "group partitioning needs an even number of clients, got {}",
            num_clients
        )));
    }
    if let Some(test) = test {
        if test.feature_names != train.feature_names {
            return Err(FairHnError::Data("train and test columns differ".into()));
        }
    }
    let per_group = num_clients / 2;

    let (train_a, train_b) = rule.split(train)?;
    let mut groups = [train_a, train_b];
    for group in groups.iter_mut() {
        group.shuffle(rng);
    }

    let test_groups: [Vec<Record>; 2] = match test {
        Some(test) => {
            let (mut a, mut b) = rule.split(test)?;
            a.shuffle(rng);
            b.shuffle(rng);
            [a, b]
        }
        None => {
            let mut held = [Vec::new(), Vec::new()];
            for (g, group) in groups.iter_mut().enumerate() {
                if group.len() <= holdout_per_group {
                    return Err(FairHnError::Data(format!(
                        "group {} has {} records, not enough for a holdout of {}",
                        g,
                        group.len(),
                        holdout_per_group
                    )));
                }
                held[g] = group.split_off(group.len() - holdout_per_group);
            }
            held
        }
    };

    let mut partitions = Vec::with_capacity(num_clients);
    for (g, (train_group, test_group)) in groups.into_iter().zip(test_groups).enumerate() {
        debug!(
            "group {}: {} train / {} test records",
            g,
            train_group.len(),
            test_group.len()
        );
        let train_shards = shard(train_group, per_group);
        let test_shards = shard(test_group, per_group);
        for (tr, te) in train_shards.into_iter().zip(test_shards) {
            partitions.push(ClientPartition::new(tr, te));
        }
    }

    for (client, p) in partitions.iter().enumerate() {
        if p.train.is_empty() || p.test.is_empty() {
            return Err(FairHnError::Data(format!(
                "client {} received an empty partition ({} train, {} test)",
                client,
                p.train.len(),
                p.test.len()
            )));
        }
    }

    info!("Partitioned data into {} clients on '{}'", num_clients, rule.column);
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn dataset(ages: &[f32]) -> Dataset {
        Dataset {
            feature_names: vec!["age".into(), "sex".into()],
            records: ages
                .iter()
                .enumerate()
                .map(|(i, a)| Record::new(vec![*a, (i % 2) as f32], (i % 2) as f32, (i % 2) as f32))
                .collect(),
        }
    }

    #[test]
    fn test_rule_matching() {
        let rule = GroupRule::at_most("age", 31.0);
        assert!(rule.matches(31.0));
        assert!(!rule.matches(31.5));
        assert!(GroupRule::equals("workclass", 1.0).matches(1.0));
    }

    #[test]
    fn test_four_clients_from_two_groups() {
        let train = dataset(&[20.0, 22.0, 25.0, 30.0, 40.0, 45.0, 50.0, 60.0, 70.0]);
        let test = dataset(&[21.0, 23.0, 41.0, 42.0]);
        let mut rng = StdRng::seed_from_u64(0);

        let parts = build_client_partitions(
            &train,
            Some(&test),
            &GroupRule::at_most("age", 31.0),
            4,
            0,
            &mut rng,
        )
        .unwrap();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].train.len(), 2);
        assert_eq!(parts[1].train.len(), 2);
        assert_eq!(parts[2].train.len(), 2);
        assert_eq!(parts[3].train.len(), 3);
        assert!(parts[0].train.iter().all(|r| r.features[0] <= 31.0));
        assert!(parts[3].test.iter().all(|r| r.features[0] > 31.0));
    }

    #[test]
    fn test_holdout_without_test_file() {
        let train = dataset(&[20.0, 21.0, 22.0, 23.0, 24.0, 40.0, 41.0, 42.0, 43.0, 44.0]);
        let mut rng = StdRng::seed_from_u64(0);

        let parts =
            build_client_partitions(&train, None, &GroupRule::at_most("age", 31.0), 2, 2, &mut rng)
                .unwrap();

        assert_eq!(parts[0].train.len(), 3);
        assert_eq!(parts[0].test.len(), 2);
        assert_eq!(parts[1].test.len(), 2);
    }

    #[test]
    fn test_odd_client_count_rejected() {
        let train = dataset(&[20.0, 40.0]);
        let mut rng = StdRng::seed_from_u64(0);
        let err =
            build_client_partitions(&train, None, &GroupRule::at_most("age", 31.0), 3, 0, &mut rng)
                .unwrap_err();
        assert!(matches!(err, FairHnError::Config(_)));
    }

    #[test]
    fn test_small_group_rejected() {
        let train = dataset(&[20.0, 40.0, 41.0]);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(
            build_client_partitions(&train, None, &GroupRule::at_most("age", 31.0), 2, 1, &mut rng)
                .is_err()
        );
    }
}
