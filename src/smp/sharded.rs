//! One service instance per shard.
//!
//! [`Sharded::start`] builds an instance of a service on every shard with a
//! factory. Each instance lives in its shard's local registry and is only
//! ever touched on that shard; other shards reach it with
//! [`Sharded::invoke_on`]. The handle itself carries nothing but an id, so
//! it is cheap to copy into cross-shard closures.

use crate::error::{Error, Result};
use crate::future::{when_all_succeed, Future};
use crate::smp::{self, submit_to};
use crate::types::ShardId;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SERVICE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SERVICES: RefCell<HashMap<u64, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

/// A per-shard service.
pub trait Service: 'static {
    /// Called on every shard by [`Sharded::stop`] before the instance is
    /// dropped.
    fn stop(&self) -> Future<()> {
        Future::ready(())
    }
}

/// Handle to a service with one instance per shard.
pub struct Sharded<S> {
    id: u64,
    _service: PhantomData<fn() -> S>,
}

/// Alternate name for [`Sharded`].
pub type Distributed<S> = Sharded<S>;

impl<S> Clone for Sharded<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Sharded<S> {}

impl<S> fmt::Debug for Sharded<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sharded").field("id", &self.id).finish()
    }
}

fn lookup<S: Service>(id: u64) -> Result<Rc<S>> {
    let entry = SERVICES.with(|services| services.borrow().get(&id).cloned());
    let Some(entry) = entry else {
        return Err(Error::invalid_state(format!(
            "service {id} is not running on shard {}",
            smp::this_shard_id()
        )));
    };
    entry
        .downcast::<S>()
        .map_err(|_| Error::internal(format!("service {id} has an unexpected type")))
}

impl<S: Service> Sharded<S> {
    /// Builds one instance per shard with `factory` and resolves once every
    /// shard has its instance.
    pub fn start<F>(factory: F) -> Future<Self>
    where
        F: Fn(ShardId) -> S + Send + Sync + 'static,
    {
        let id = NEXT_SERVICE.fetch_add(1, Ordering::Relaxed);
        smp::invoke_on_all(move || {
            let shard = smp::this_shard_id();
            let service: Rc<dyn Any> = Rc::new(factory(shard));
            SERVICES.with(|services| services.borrow_mut().insert(id, service));
            tracing::debug!(shard = %shard, service = id, "sharded service started");
            Future::ready(())
        })
        .map(move |()| Self {
            id,
            _service: PhantomData,
        })
    }

    /// The instance on the calling shard.
    pub fn local(&self) -> Result<Rc<S>> {
        lookup(self.id)
    }

    /// Runs `func` against the instance on `shard`.
    pub fn invoke_on<R, F>(&self, shard: ShardId, func: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(Rc<S>) -> Future<R> + Send + 'static,
    {
        let id = self.id;
        submit_to(shard, move || match lookup::<S>(id) {
            Ok(service) => func(service),
            Err(err) => Future::failed(err),
        })
    }

    /// Runs `func` against every instance.
    pub fn invoke_on_all<F>(&self, func: F) -> Future<()>
    where
        F: Fn(Rc<S>) -> Future<()> + Send + Sync + 'static,
    {
        let id = self.id;
        smp::invoke_on_all(move || match lookup::<S>(id) {
            Ok(service) => func(service),
            Err(err) => Future::failed(err),
        })
    }

    /// Maps every instance with `mapper` and folds the results in shard
    /// order.
    pub fn map_reduce<R, A, M, F>(&self, mapper: M, initial: A, reducer: F) -> Future<A>
    where
        R: Send + 'static,
        A: 'static,
        M: Fn(Rc<S>) -> Future<R> + Send + Sync + 'static,
        F: FnMut(A, R) -> A + 'static,
    {
        let mapper = Arc::new(mapper);
        let calls = smp::all_shards()
            .map(|shard| {
                let mapper = Arc::clone(&mapper);
                self.invoke_on(shard, move |service| mapper(service))
            })
            .collect();
        when_all_succeed(calls).map(move |values| values.into_iter().fold(initial, reducer))
    }

    /// Stops the instance on every shard and drops it.
    pub fn stop(&self) -> Future<()> {
        let id = self.id;
        smp::invoke_on_all(move || {
            let service = SERVICES.with(|services| services.borrow_mut().remove(&id));
            let Some(service) = service else {
                return Future::ready(());
            };
            match service.downcast::<S>() {
                Ok(service) => {
                    let keep = Rc::clone(&service);
                    service.stop().finally(move || {
                        drop(keep);
                        Future::ready(())
                    })
                }
                Err(_) => Future::failed(Error::internal(format!(
                    "service {id} has an unexpected type"
                ))),
            }
        })
    }
}
