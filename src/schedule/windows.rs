//! Window generators over the ordered block list

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Fine-tune, attach-loss and observe block ranges of one window
///
/// The ranges are contiguous: `fine_tune.end == attach.start` and
/// `attach.end == observe.start`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWindow {
    pub fine_tune: Range<usize>,
    pub attach: Range<usize>,
    pub observe: Range<usize>,
}

impl BlockWindow {
    /// Window starting at `start`, every range clipped at `total`
    pub fn clipped(
        start: usize,
        num_fine_tune: usize,
        num_lookahead: usize,
        num_observe: usize,
        total: usize,
    ) -> Self {
        let ft_end = (start + num_fine_tune).min(total);
        let al_end = (ft_end + num_lookahead).min(total);
        let ob_end = (al_end + num_observe).min(total);
        Self {
            fine_tune: start..ft_end,
            attach: ft_end..al_end,
            observe: al_end..ob_end,
        }
    }

    /// Whether the ranges chain and stay within `total` blocks
    pub fn is_valid(&self, total: usize) -> bool {
        self.fine_tune.start <= self.fine_tune.end
            && self.fine_tune.end == self.attach.start
            && self.attach.start <= self.attach.end
            && self.attach.end == self.observe.start
            && self.observe.start <= self.observe.end
            && self.observe.end <= total
    }

    /// Number of blocks that are quantized once this window is done
    pub fn num_quantized_blocks(&self) -> usize {
        self.fine_tune.end
    }
}

/// Overlapping sliding windows
///
/// Windows start every `block_step_size` blocks. The first window grows its
/// fine-tune range from `block_step_size` to `nblocks` in steps of
/// `block_step_size`; later windows fine-tune `nblocks` blocks.
pub fn standard_windows(
    nblocks: usize,
    block_step_size: usize,
    num_lookahead_blocks: usize,
    num_observe_blocks: usize,
    total_num_blocks: usize,
) -> Result<Vec<BlockWindow>> {
    if nblocks == 0 || nblocks > total_num_blocks {
        return Err(Error::Schedule(format!(
            "nblocks must be between 1 and {total_num_blocks}, got {nblocks}"
        )));
    }
    if block_step_size == 0 || block_step_size > nblocks {
        return Err(Error::Schedule(format!(
            "block_step_size must be between 1 and {nblocks}, got {block_step_size}"
        )));
    }
    if num_lookahead_blocks > total_num_blocks - 1 {
        return Err(Error::Schedule(format!(
            "num_lookahead_blocks must be between 0 and {}, got {num_lookahead_blocks}",
            total_num_blocks - 1
        )));
    }

    let mut windows = Vec::new();
    for start in (0..total_num_blocks).step_by(block_step_size) {
        if start == 0 {
            for num_fine_tune in (block_step_size..=nblocks).step_by(block_step_size) {
                windows.push(BlockWindow::clipped(
                    0,
                    num_fine_tune,
                    num_lookahead_blocks,
                    num_observe_blocks,
                    total_num_blocks,
                ));
            }
        } else {
            windows.push(BlockWindow::clipped(
                start,
                nblocks,
                num_lookahead_blocks,
                num_observe_blocks,
                total_num_blocks,
            ));
        }
    }
    Ok(windows)
}

/// Disjoint groups of `num_lookahead_blocks + 1` blocks
///
/// Each block of a group is fine-tuned in turn with the remaining blocks of
/// the group as its attach-loss segment; the last block of a group has empty
/// attach-loss and observe segments.
///
/// The attach segment spans the whole rest of the group, not only its last
/// block.
pub fn cleanly_separated_windows(
    num_lookahead_blocks: usize,
    total_num_blocks: usize,
) -> Vec<BlockWindow> {
    let mut windows = Vec::with_capacity(total_num_blocks);
    for group_start in (0..total_num_blocks).step_by(num_lookahead_blocks + 1) {
        let attach_idx = (group_start + num_lookahead_blocks).min(total_num_blocks - 1);
        for ft in group_start..=attach_idx {
            let end = attach_idx + 1;
            let ft_end = ft + 1;
            windows.push(BlockWindow {
                fine_tune: ft..ft_end,
                attach: ft_end..end,
                observe: end..end,
            });
        }
    }
    windows
}

/// Sweep of the attach-loss boundary for one fixed fine-tune block
///
/// `attach_loss_block_indices == [-1]` sweeps every index from
/// `fine_tune_block_idx` to `observe_block_idx`.
pub fn ablation_windows(
    fine_tune_block_idx: usize,
    observe_block_idx: usize,
    attach_loss_block_indices: &[i64],
    total_num_blocks: usize,
) -> Result<Vec<BlockWindow>> {
    if observe_block_idx >= total_num_blocks {
        return Err(Error::Schedule(format!(
            "observe_block_idx {observe_block_idx} should be less than the number of blocks {total_num_blocks}"
        )));
    }
    if fine_tune_block_idx > observe_block_idx {
        return Err(Error::Schedule(format!(
            "fine_tune_block_idx {fine_tune_block_idx} is after observe_block_idx {observe_block_idx}"
        )));
    }
    let sweep: Vec<usize> = match attach_loss_block_indices {
        [] | [-1] => (fine_tune_block_idx..=observe_block_idx).collect(),
        indices => indices
            .iter()
            .map(|&idx| {
                usize::try_from(idx)
                    .ok()
                    .filter(|i| (fine_tune_block_idx..=observe_block_idx).contains(i))
                    .ok_or_else(|| {
                        Error::Schedule(format!(
                            "attach loss block index {idx} outside {fine_tune_block_idx}..={observe_block_idx}"
                        ))
                    })
            })
            .collect::<Result<_>>()?,
    };
    let ft_end = fine_tune_block_idx + 1;
    Ok(sweep
        .into_iter()
        .map(|attach_idx| BlockWindow {
            fine_tune: fine_tune_block_idx..ft_end,
            attach: ft_end..attach_idx + 1,
            observe: attach_idx + 1..observe_block_idx + 1,
        })
        .collect())
}
