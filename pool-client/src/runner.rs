//! Pool access from threads without a tokio runtime
//!
//! [`PoolRunner`] owns a dedicated multi-threaded runtime and an open pool.
//! Blocking calls must not be made from inside another async runtime.

use crate::catchup::CatchupOutcome;
use crate::config::PoolConfig;
use crate::dispatcher::RequestPolicy;
use crate::network::{NodeTransport, TcpTransport};
use crate::pool::PoolHandle;
use crate::types::{ConsensusResult, PoolTransaction, Request};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

/// Dedicated runtime plus an open pool
#[derive(Debug)]
pub struct PoolRunner {
    runtime: Option<Runtime>,
    pool: Arc<PoolHandle>,
}

impl PoolRunner {
    /// Open a pool over TCP on a fresh runtime
    pub fn open(genesis: Vec<PoolTransaction>, config: PoolConfig) -> Result<Self> {
        Self::open_with_transport(genesis, config, Arc::new(TcpTransport::new()))
    }

    /// Open a pool over `transport` on a fresh runtime
    pub fn open_with_transport(
        genesis: Vec<PoolTransaction>,
        config: PoolConfig,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pool-runner")
            .enable_all()
            .build()?;

        let pool = runtime.block_on(PoolHandle::open_with_transport(genesis, config, transport))?;
        debug!("Pool runner started");

        Ok(Self {
            runtime: Some(runtime),
            pool: Arc::new(pool),
        })
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or(Error::PoolClosed)
    }

    /// Submit and block the calling thread until the result is known
    pub fn submit_blocking(
        &self,
        request: Request,
        policy: RequestPolicy,
    ) -> Result<ConsensusResult> {
        let pool = Arc::clone(&self.pool);
        self.runtime()?
            .block_on(async move { pool.submit(&request, &policy).await })
    }

    /// Submit and deliver the result to `callback` on a runtime thread
    pub fn submit_with_callback<F>(
        &self,
        request: Request,
        policy: RequestPolicy,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<ConsensusResult>) + Send + 'static,
    {
        if self.pool.is_closed() {
            return Err(Error::PoolClosed);
        }
        let pool = Arc::clone(&self.pool);
        self.runtime()?.spawn(async move {
            callback(pool.submit(&request, &policy).await);
        });
        Ok(())
    }

    /// Run a catchup and block until it finishes
    pub fn refresh_blocking(&self) -> Result<CatchupOutcome> {
        let pool = Arc::clone(&self.pool);
        self.runtime()?.block_on(async move { pool.refresh().await })
    }

    /// The open pool
    pub fn pool(&self) -> &Arc<PoolHandle> {
        &self.pool
    }

    /// Close the pool; idempotent
    pub fn close(&self) {
        self.pool.close();
    }
}

impl Drop for PoolRunner {
    fn drop(&mut self) {
        self.pool.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
