//! Built-in `synthetic` connector type: emits a fixed number of generated
//! items in pages, checkpointing the position as a decimal offset.
//!
//! Parameters: `total` (default 1000), `page_size` (default 100) and
//! `page_delay_ms` (default 0), the simulated repository latency per page.

use std::time::Duration;

use conduit_core::ConnectorConfig;

use crate::pool::CancelToken;
use crate::traversal::{ConnectorType, DocumentBatch, TraversalError, TraversalManager};

const DEFAULT_TOTAL: u64 = 1_000;
const DEFAULT_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyntheticParams {
    total: u64,
    page_size: u64,
    page_delay: Duration,
}

impl SyntheticParams {
    fn parse(config: &ConnectorConfig) -> Result<Self, String> {
        let number = |key: &str, default: u64| -> Result<u64, String> {
            match config.param(key) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| format!("parameter `{}` is not a number: {:?}", key, raw)),
            }
        };
        let params = Self {
            total: number("total", DEFAULT_TOTAL)?,
            page_size: number("page_size", DEFAULT_PAGE_SIZE)?,
            page_delay: Duration::from_millis(number("page_delay_ms", 0)?),
        };
        if params.page_size == 0 {
            return Err("parameter `page_size` must be positive".to_string());
        }
        Ok(params)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticType;

impl ConnectorType for SyntheticType {
    fn type_name(&self) -> &str {
        "synthetic"
    }

    fn validate_config(&self, config: &ConnectorConfig) -> Result<(), String> {
        SyntheticParams::parse(config).map(drop)
    }

    fn instantiate(
        &self,
        _connector: &str,
        config: &ConnectorConfig,
    ) -> Result<Box<dyn TraversalManager>, String> {
        Ok(Box::new(SyntheticTraversal {
            params: SyntheticParams::parse(config)?,
        }))
    }
}

struct SyntheticTraversal {
    params: SyntheticParams,
}

impl SyntheticTraversal {
    fn page(
        &self,
        position: u64,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<Option<DocumentBatch>, TraversalError> {
        if position >= self.params.total {
            return Ok(None);
        }
        if !self.params.page_delay.is_zero() && cancel.wait_timeout(self.params.page_delay) {
            return Err(TraversalError::Cancelled);
        }
        let count = (self.params.total - position)
            .min(self.params.page_size)
            .min(max_items as u64);
        Ok(Some(DocumentBatch {
            count: count as usize,
            checkpoint: Some((position + count).to_string()),
        }))
    }
}

impl TraversalManager for SyntheticTraversal {
    fn start_traversal(
        &mut self,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<Option<DocumentBatch>, TraversalError> {
        self.page(0, max_items, cancel)
    }

    fn resume_traversal(
        &mut self,
        checkpoint: &str,
        max_items: usize,
        cancel: &CancelToken,
    ) -> Result<Option<DocumentBatch>, TraversalError> {
        let position = checkpoint
            .parse()
            .map_err(|_| TraversalError::Repository(format!("bad checkpoint {:?}", checkpoint)))?;
        self.page(position, max_items, cancel)
    }
}
