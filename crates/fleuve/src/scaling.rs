//! Offset migration when resizing the partition set.
//!
//! Reader names embed the partition total, so a resize renames every
//! reader. [`rebalance`] carries committed positions across the rename:
//! same-index readers keep their offset (raised on scale-down so removed
//! partitions' progress is not lost), truly new readers start at the
//! minimum of the old set so no event can be skipped. Re-processing is
//! bounded by the spread between offsets; idempotent command handling
//! absorbs it.

use tracing::info;

use crate::error::Result;
use crate::partition::make_reader_name;
use crate::store::OffsetStore;

/// What a [`rebalance`] did, for logging and operator review.
#[derive(Debug, Clone)]
pub struct RebalanceReport {
    pub workflow_type: String,
    pub old_total: u32,
    pub new_total: u32,
    /// `(reader_name, offset)` for readers carried over by index.
    pub carried: Vec<(String, i64)>,
    /// `(reader_name, offset)` for newly added readers.
    pub added: Vec<(String, i64)>,
    /// Old reader rows that were deleted.
    pub removed: Vec<String>,
}

/// Minimum committed offset across `readers`, 0 when none have rows.
pub async fn get_min_offset<S: OffsetStore>(store: &S, readers: &[String]) -> Result<i64> {
    let rows = store.offsets(readers).await?;
    Ok(rows
        .iter()
        .map(|row| row.last_read_event_no)
        .min()
        .unwrap_or(0))
}

/// Maximum committed offset across `readers`, 0 when none have rows.
pub async fn get_max_offset<S: OffsetStore>(store: &S, readers: &[String]) -> Result<i64> {
    let rows = store.offsets(readers).await?;
    Ok(rows
        .iter()
        .map(|row| row.last_read_event_no)
        .max()
        .unwrap_or(0))
}

/// Migrate reader offsets from an `old_total`-partition layout to a
/// `new_total` one. Run only while all runners are stopped with their
/// offsets committed.
pub async fn rebalance<S: OffsetStore>(
    store: &S,
    workflow_type: &str,
    old_total: u32,
    new_total: u32,
) -> Result<RebalanceReport> {
    let old_names: Vec<String> = (0..old_total)
        .map(|index| make_reader_name(workflow_type, index, old_total))
        .collect();

    let offset_of = |rows: &[crate::store::OffsetRow], name: &str| -> i64 {
        rows.iter()
            .find(|row| row.reader == name)
            .map(|row| row.last_read_event_no)
            .unwrap_or(0)
    };
    let old_rows = store.offsets(&old_names).await?;

    let carried_count = old_total.min(new_total);
    let mut carried = Vec::new();
    let mut added = Vec::new();

    // Offsets of partitions that disappear on scale-down; their progress is
    // folded into the survivors as a max so nothing they consumed is lost.
    let removed_max = old_names
        .iter()
        .skip(carried_count as usize)
        .map(|name| offset_of(&old_rows, name))
        .max()
        .unwrap_or(0);

    // Floor for readers that did not exist before: nothing below the
    // slowest old reader may be skipped.
    let old_min = old_names
        .iter()
        .map(|name| offset_of(&old_rows, name))
        .min()
        .unwrap_or(0);

    for index in 0..carried_count {
        let new_name = make_reader_name(workflow_type, index, new_total);
        let own = offset_of(&old_rows, &old_names[index as usize]);
        let offset = if new_total < old_total {
            own.max(removed_max)
        } else {
            own
        };
        store.set_offset(&new_name, offset).await?;
        carried.push((new_name, offset));
    }

    for index in carried_count..new_total {
        let new_name = make_reader_name(workflow_type, index, new_total);
        store.set_offset(&new_name, old_min).await?;
        added.push((new_name, old_min));
    }

    store.delete_offsets(&old_names).await?;

    let report = RebalanceReport {
        workflow_type: workflow_type.to_owned(),
        old_total,
        new_total,
        carried,
        added,
        removed: old_names,
    };
    info!(
        workflow_type,
        old_total,
        new_total,
        carried = report.carried.len(),
        added = report.added.len(),
        "Rebalanced reader offsets"
    );
    Ok(report)
}
