//! Hash partitioning of workflow ids across runner processes.

use crate::error::{Error, Result};

/// Stable partition assignment for a workflow id.
///
/// The hash is MD5 over the id's UTF-8 bytes, interpreted as a big-endian
/// 128-bit integer, modulo the partition count. This exact choice is part
/// of the on-disk format: changing it would reassign every workflow and
/// invalidate the reader predicates, so it is pinned forever.
pub fn partition_index(workflow_id: &str, total_partitions: u32) -> u32 {
    let digest = md5::compute(workflow_id.as_bytes());
    let value = u128::from_be_bytes(digest.0);
    (value % u128::from(total_partitions.max(1))) as u32
}

/// Predicate answering "does this workflow id belong to my partition".
pub fn make_partition_predicate(
    index: u32,
    total_partitions: u32,
) -> Result<impl Fn(&str) -> bool + Send + Sync + Clone + 'static> {
    validate_partition(index, total_partitions)?;
    Ok(move |workflow_id: &str| partition_index(workflow_id, total_partitions) == index)
}

/// Canonical reader name for one partition of a workflow type:
/// `{workflow_type}.{partition_index}.of.{total_partitions}`.
///
/// The total is part of the name, so resizing renames every reader; the
/// offset migration in [`scaling`](crate::scaling) carries positions across.
pub fn make_reader_name(workflow_type: &str, partition_index: u32, total_partitions: u32) -> String {
    format!("{workflow_type}.{partition_index}.of.{total_partitions}")
}

fn validate_partition(partition_index: u32, total_partitions: u32) -> Result<()> {
    if total_partitions == 0 {
        return Err(Error::Configuration(
            "total_partitions must be > 0".to_owned(),
        ));
    }
    if partition_index >= total_partitions {
        return Err(Error::Configuration(format!(
            "partition_index must be in [0, {total_partitions}), got {partition_index}"
        )));
    }
    Ok(())
}

/// Configuration of one partitioned runner.
#[derive(Debug, Clone)]
pub struct PartitionedRunnerConfig {
    pub partition_index: u32,
    pub total_partitions: u32,
    pub workflow_type: String,
    pub reader_name: String,
}

impl PartitionedRunnerConfig {
    pub fn new(
        workflow_type: impl Into<String>,
        partition_index: u32,
        total_partitions: u32,
    ) -> Result<Self> {
        validate_partition(partition_index, total_partitions)?;
        let workflow_type = workflow_type.into();
        let reader_name = make_reader_name(&workflow_type, partition_index, total_partitions);
        Ok(Self {
            partition_index,
            total_partitions,
            workflow_type,
            reader_name,
        })
    }

    /// This partition's workflow-id rule.
    pub fn owns(&self, workflow_id: &str) -> bool {
        partition_index(workflow_id, self.total_partitions) == self.partition_index
    }
}

/// Configurations for every partition of a workflow type.
pub fn create_partitioned_configs(
    workflow_type: &str,
    total_partitions: u32,
) -> Result<Vec<PartitionedRunnerConfig>> {
    (0..total_partitions)
        .map(|index| PartitionedRunnerConfig::new(workflow_type, index, total_partitions))
        .collect()
}
