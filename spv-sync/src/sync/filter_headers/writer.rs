use bitcoin::bip158::FilterHeader;
use bitcoin::p2p::message_filter::CFHeaders;

use super::util::compute_filter_headers;
use super::FilterHeaderSyncEngine;
use crate::error::{FatalError, SyncError, SyncResult};
use crate::storage::{BlockHeaderStorage, FilterHeaderStorage};
use crate::types::FilterHeaderEntry;

impl<B, F> FilterHeaderSyncEngine<B, F>
where
    B: BlockHeaderStorage,
    F: FilterHeaderStorage,
{
    /// Chain the filter hashes of `msg` onto the stored filter tip and append them.
    ///
    /// Each new entry is paired with the block at the same height, found by walking
    /// back from the message's stop hash. Returns the last filter header written.
    pub(super) async fn write_cfheaders(&mut self, msg: &CFHeaders) -> SyncResult<FilterHeader> {
        let mut filter_storage = self.filter_storage.write().await;

        let tip = filter_storage
            .filter_chain_tip()
            .await?
            .ok_or_else(|| SyncError::MissingDependency("filter header store is empty".into()))?;
        if tip.filter_header != msg.previous_filter_header {
            return Err(FatalError::new(
                "write filter headers",
                format!(
                    "attempt to write cfheaders out of order! Tip={} (height={}), prev_hash={}",
                    tip.filter_header, tip.height, msg.previous_filter_header
                ),
            )
            .into());
        }
        if msg.filter_hashes.is_empty() {
            return Ok(tip.filter_header);
        }

        let headers = compute_filter_headers(&msg.previous_filter_header, &msg.filter_hashes);
        let count = headers.len() as u32;

        let (blocks, start_height) = self
            .block_storage
            .read()
            .await
            .fetch_header_ancestors(count, &msg.stop_hash)
            .await?;
        if start_height != tip.height + 1 {
            return Err(SyncError::Validation(format!(
                "{} cfheaders ending at block {} start at height {}, filter tip is at {}",
                count, msg.stop_hash, start_height, tip.height
            )));
        }

        let entries: Vec<FilterHeaderEntry> = headers
            .iter()
            .zip(&blocks)
            .enumerate()
            .map(|(i, (filter_header, block))| FilterHeaderEntry {
                filter_header: *filter_header,
                height: start_height + i as u32,
                block_hash: block.block_hash(),
            })
            .collect();

        filter_storage
            .write_filter_headers(&entries)
            .await
            .map_err(|e| FatalError::new("write filter headers", e.to_string()))?;
        drop(filter_storage);

        for (entry, block) in entries.iter().zip(&blocks) {
            self.logger.log_height(block.time, entry.height);
        }

        let Some(last) = entries.last().copied() else {
            return Ok(tip.filter_header);
        };
        tracing::debug!(
            "Wrote filter headers up to height {}, hash {}, new tip {}",
            last.height,
            last.block_hash,
            last.filter_header
        );

        self.progress.add_processed(count);
        self.progress.update_current_height(last.height);
        self.status.filter_tip_signal().publish(last);

        Ok(last.filter_header)
    }
}
