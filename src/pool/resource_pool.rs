//! A bounded pool of lazily-created, reusable resources.
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::{Error, PoolError};

/// Default bound on how long [`ResourcePool::close`] waits for checked-out resources.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates, health-checks and disposes of the resources held by a [`ResourcePool`].
#[async_trait::async_trait]
pub trait Manager: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Create a brand new resource.
    async fn create(&self) -> Result<Self::Resource, Error>;

    /// Check an idle resource before handing it out again.
    ///
    /// A resource failing the check is closed and replaced.
    async fn recycle(&self, resource: &mut Self::Resource) -> Result<(), Error>;

    /// Dispose of a resource.
    async fn close(&self, resource: Self::Resource) -> Result<(), Error>;
}

/// A snapshot of the state of a [`ResourcePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    /// The maximum number of resources checked out at the same time.
    pub max_size: usize,
    /// Resources currently managed by the pool, idle or checked out.
    pub size: usize,
    /// Resources waiting in the pool to be handed out.
    pub idle: usize,
    /// Resources checked out and not yet released.
    pub outstanding: usize,
    /// [`ResourcePool::close`] has been called.
    pub closed: bool,
}

/// A bounded pool of reusable resources.
///
/// At most `max_size` resources are checked out at any given time. Resources are created on
/// demand and reused once released; callers waiting for a resource are served in FIFO order.
///
/// Cloning a pool gives another handle to the same set of resources.
pub struct ResourcePool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<M: Manager> {
    manager: M,
    max_size: usize,
    drain_timeout: Duration,
    // Fair: waiters are woken up in the order they started waiting.
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<M::Resource>>,
    returned: Notify,
}

struct PoolState<R> {
    idle: VecDeque<R>,
    /// Released after the pool started closing, waiting for `close` to dispose of them.
    retired: Vec<R>,
    outstanding: usize,
    closed: bool,
    /// `close` has returned: late releases are disposed of in a background task.
    drained: bool,
}

/// Configures and builds a [`ResourcePool`].
pub struct ResourcePoolBuilder<M: Manager> {
    manager: M,
    max_size: usize,
    drain_timeout: Duration,
}

impl<M: Manager> ResourcePoolBuilder<M> {
    /// The maximum number of resources checked out at the same time.
    ///
    /// Default: 10.
    pub fn max_size(self, max_size: usize) -> Self {
        Self { max_size, ..self }
    }

    /// How long [`ResourcePool::close`] waits for checked-out resources to be released.
    ///
    /// Default: 30 seconds.
    pub fn drain_timeout(self, drain_timeout: Duration) -> Self {
        Self {
            drain_timeout,
            ..self
        }
    }

    pub fn build(self) -> Result<ResourcePool<M>, Error> {
        if self.max_size == 0 {
            return Err(anyhow::anyhow!("The maximum size of a pool must be greater than zero").into());
        }
        Ok(ResourcePool {
            inner: Arc::new(PoolInner {
                manager: self.manager,
                max_size: self.max_size,
                drain_timeout: self.drain_timeout,
                semaphore: Arc::new(Semaphore::new(self.max_size)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(self.max_size),
                    retired: Vec::new(),
                    outstanding: 0,
                    closed: false,
                    drained: false,
                }),
                returned: Notify::new(),
            }),
        })
    }
}

impl<M: Manager> ResourcePool<M> {
    pub fn builder(manager: M) -> ResourcePoolBuilder<M> {
        ResourcePoolBuilder {
            manager,
            max_size: 10,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Check out a resource.
    ///
    /// An idle resource is reused if it passes [`Manager::recycle`], otherwise a new one is
    /// created. If `max_size` resources are already checked out, this waits until one is
    /// released.
    /// Fails with [`PoolError::Closed`] once [`ResourcePool::close`] has been called, including
    /// for callers that were already waiting or creating their resource.
    pub async fn acquire(&self) -> Result<Pooled<M>, PoolError> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        loop {
            let idle = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                state.idle.pop_front()
            };
            let Some(mut resource) = idle else {
                break;
            };
            match self.inner.manager.recycle(&mut resource).await {
                Ok(()) => return self.checkout(resource, permit).await,
                Err(e) => {
                    tracing::debug!(error = %e, "Discarding an unhealthy pooled resource");
                    self.inner.dispose(resource).await;
                }
            }
        }
        // The permit is released if creation fails: the slot goes back to the pool.
        let resource = self.inner.manager.create().await?;
        self.checkout(resource, permit).await
    }

    /// Hand `resource` out, unless the pool was closed while it was being created or recycled.
    async fn checkout(
        &self,
        resource: M::Resource,
        permit: OwnedSemaphorePermit,
    ) -> Result<Pooled<M>, PoolError> {
        {
            let mut state = self.inner.state.lock();
            if !state.closed {
                state.outstanding += 1;
                return Ok(Pooled {
                    resource: Some(resource),
                    pool: Arc::clone(&self.inner),
                    _permit: permit,
                });
            }
        }
        self.inner.dispose(resource).await;
        Err(PoolError::Closed)
    }

    /// Give a resource back to the pool. Equivalent to dropping the guard.
    pub fn release(&self, pooled: Pooled<M>) {
        drop(pooled);
    }

    /// Shut the pool down.
    ///
    /// New and pending [`ResourcePool::acquire`] calls fail with [`PoolError::Closed`].
    /// Idle resources are closed straight away; checked-out resources are closed as they are
    /// released. The wait for checked-out resources is bounded by the pool's drain timeout:
    /// anything released after that is closed in a background task.
    ///
    /// Calling `close` on a pool that is already closed is a no-op.
    #[tracing::instrument(name = "pool_close", skip(self), fields(max_size = self.inner.max_size))]
    pub async fn close(&self) {
        let idle: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.inner.semaphore.close();
        for resource in idle {
            self.inner.dispose(resource).await;
        }

        let deadline = Instant::now() + self.inner.drain_timeout;
        loop {
            let (retired, outstanding) = {
                let mut state = self.inner.state.lock();
                (std::mem::take(&mut state.retired), state.outstanding)
            };
            for resource in retired {
                self.inner.dispose(resource).await;
            }
            if outstanding == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, self.inner.returned.notified())
                .await
                .is_err()
            {
                tracing::warn!(
                    outstanding,
                    "Gave up waiting for checked-out resources, they will be closed on release"
                );
                break;
            }
        }

        let retired = {
            let mut state = self.inner.state.lock();
            state.drained = true;
            std::mem::take(&mut state.retired)
        };
        for resource in retired {
            self.inner.dispose(resource).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            max_size: self.inner.max_size,
            size: state.idle.len() + state.outstanding,
            idle: state.idle.len(),
            outstanding: state.outstanding,
            closed: state.closed,
        }
    }
}

impl<M: Manager> PoolInner<M> {
    async fn dispose(&self, resource: M::Resource) {
        if let Err(e) = self.manager.close(resource).await {
            tracing::warn!(error = %e, "Failed to close a pooled resource");
        }
    }

    fn give_back(self: &Arc<Self>, resource: M::Resource) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if !state.closed {
            state.idle.push_back(resource);
        } else if !state.drained {
            state.retired.push(resource);
            drop(state);
            self.returned.notify_one();
        } else {
            drop(state);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let pool = Arc::clone(self);
                    handle.spawn(async move { pool.dispose(resource).await });
                }
                Err(_) => {
                    tracing::warn!("No runtime available to close a late-released resource, dropping it");
                }
            }
        }
    }
}

impl<M: Manager> fmt::Debug for ResourcePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("status", &self.status())
            .finish()
    }
}

/// A resource checked out from a [`ResourcePool`].
///
/// The resource goes back to the pool when the guard is dropped, on every exit path.
pub struct Pooled<M: Manager> {
    resource: Option<M::Resource>,
    pool: Arc<PoolInner<M>>,
    // Released after the resource is back in the idle queue (fields drop after `Drop::drop`).
    _permit: OwnedSemaphorePermit,
}

impl<M: Manager> Pooled<M> {
    /// Take the resource out of the pool.
    ///
    /// The pool forgets about it and its slot becomes available: the caller is now responsible
    /// for closing it.
    pub fn detach(mut this: Self) -> M::Resource {
        let closed = {
            let mut state = this.pool.state.lock();
            state.outstanding -= 1;
            state.closed
        };
        if closed {
            this.pool.returned.notify_one();
        }
        this.resource
            .take()
            .unwrap_or_else(|| unreachable!("the resource is only taken on detach or drop"))
    }
}

impl<M: Manager> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &M::Resource {
        self.resource
            .as_ref()
            .unwrap_or_else(|| unreachable!("the resource is only taken on detach or drop"))
    }
}

impl<M: Manager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut M::Resource {
        self.resource
            .as_mut()
            .unwrap_or_else(|| unreachable!("the resource is only taken on detach or drop"))
    }
}

impl<M: Manager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.give_back(resource);
        }
    }
}

impl<M: Manager> fmt::Debug for Pooled<M>
where
    M::Resource: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.resource).finish()
    }
}
