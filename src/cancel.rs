//! 用户中断（Ctrl-C）分发给最后注册的处理者。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info};

use crate::error::Result;

/// 在系统中断线程上调用。返回中断是否已处理；`false` 时由系统默认行为处理。
pub type Dispatch = Arc<dyn Fn() -> bool + Send + Sync>;

/// 系统中断订阅
pub trait InterruptSource: Send + Sync {
    fn subscribe(&self, dispatch: Dispatch) -> Result<()>;
    fn unsubscribe(&self);
}

type Handler = Box<dyn FnOnce() + Send>;

struct Registry {
    handlers: Vec<(u64, Handler)>,
    next_id: u64,
    subscribed: bool,
}

/// 中断处理器注册表。
///
/// 每次中断先移除最近注册的处理器，再执行一次。只有存在处理器时才保持系统订阅。
pub struct CancellationBroker {
    source: Box<dyn InterruptSource>,
    registry: Mutex<Registry>,
    me: Weak<CancellationBroker>,
}

impl CancellationBroker {
    pub fn new(source: Box<dyn InterruptSource>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            source,
            registry: Mutex::new(Registry {
                handlers: Vec::new(),
                next_id: 0,
                subscribed: false,
            }),
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register<F>(self: &Arc<Self>, handler: F) -> Result<Registration>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut registry = self.lock();
        if !registry.subscribed {
            let me = self.me.clone();
            self.source.subscribe(Arc::new(move || {
                me.upgrade().is_some_and(|broker| broker.interrupt())
            }))?;
            registry.subscribed = true;
        }

        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push((id, Box::new(handler)));
        debug!("Registered interrupt handler {}", id);

        Ok(Registration {
            broker: Arc::clone(self),
            id,
        })
    }

    /// 投递一次中断。没有注册者时返回 `false`。
    pub fn interrupt(&self) -> bool {
        let handler = {
            let mut registry = self.lock();
            let Some((id, handler)) = registry.handlers.pop() else {
                return false;
            };
            debug!("Dispatching interrupt to handler {}", id);
            self.unsubscribe_if_idle(&mut registry);
            handler
        };

        info!("Interrupt received, stopping capture");
        handler();
        true
    }

    pub fn handler_count(&self) -> usize {
        self.lock().handlers.len()
    }

    fn deregister(&self, id: u64) {
        let mut registry = self.lock();
        registry.handlers.retain(|(handler_id, _)| *handler_id != id);
        self.unsubscribe_if_idle(&mut registry);
    }

    fn unsubscribe_if_idle(&self, registry: &mut Registry) {
        if registry.handlers.is_empty() && registry.subscribed {
            self.source.unsubscribe();
            registry.subscribed = false;
        }
    }
}

/// 保持处理器注册，drop 时注销
pub struct Registration {
    broker: Arc<CancellationBroker>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.broker.deregister(self.id);
    }
}
