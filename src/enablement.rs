//! 数据包捕获绑定的全机引用计数。
//!
//! 每个捕获进程都会递增一个持久计数器。第一个进程打开 `ms_ndiscap` 绑定，
//! 最后一个进程再把它们关闭。
//!
//! 计数器的读-改-写在进程之间不是原子的：两个实例同时启动或停止时可能读到
//! 同一个值。只有绑定的修改本身在配置写锁下进行。

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::Result;

pub const CAPTURE_COMPONENT: &str = "ms_ndiscap";
pub const LOCK_CLIENT: &str = "ndisdump";
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// 本机所有实例共享的持久整数
pub trait CounterStore {
    /// 当前值；不存在时读作 0
    fn load(&self) -> Result<u32>;
    fn store(&self, value: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingPath(pub usize);

/// 系统网络配置存储的入口
pub trait NetworkConfigurationStore {
    /// 获取独占写锁（最多等待 `lock_timeout`）并打开事务。
    /// 锁一直被占用时返回 `TimeoutError`。
    fn begin<'a>(
        &'a self,
        client: &str,
        lock_timeout: Duration,
    ) -> Result<Box<dyn NetworkConfiguration + 'a>>;
}

/// 打开的配置事务。未调用 [`apply`] 就 drop 会丢弃修改；无论如何 drop 时都会释放写锁。
///
/// [`apply`]: NetworkConfiguration::apply
pub trait NetworkConfiguration {
    fn find_component(&mut self, component: &str) -> Result<ComponentId>;
    fn binding_paths_above(&mut self, component: ComponentId) -> Result<Vec<BindingPath>>;
    fn set_binding_enabled(&mut self, path: BindingPath, enabled: bool) -> Result<()>;
    fn apply(&mut self) -> Result<()>;
}

/// 计数器变化对绑定的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterTransition {
    /// 0 -> 1
    Enable,
    /// n -> n+1, n > 0
    Retain,
    /// n -> n-1, n > 1
    Release,
    /// 1 -> 0（或已经是 0）
    Disable,
}

impl CounterTransition {
    pub fn on_acquire(previous: u32) -> (u32, CounterTransition) {
        let next = previous.saturating_add(1);
        if previous == 0 {
            (next, CounterTransition::Enable)
        } else {
            (next, CounterTransition::Retain)
        }
    }

    pub fn on_release(previous: u32) -> (u32, CounterTransition) {
        let next = previous.saturating_sub(1);
        if next == 0 {
            (next, CounterTransition::Disable)
        } else {
            (next, CounterTransition::Release)
        }
    }
}

pub struct ProviderEnablement {
    counter: Box<dyn CounterStore>,
    netcfg: Box<dyn NetworkConfigurationStore>,
}

impl ProviderEnablement {
    pub fn new(counter: Box<dyn CounterStore>, netcfg: Box<dyn NetworkConfigurationStore>) -> Self {
        Self { counter, netcfg }
    }

    /// 把本进程登记为捕获用户，若是第一个则启用绑定。
    pub fn acquire(&self) -> Result<EnablementGuard<'_>> {
        let previous = self.counter.load()?;
        let (next, transition) = CounterTransition::on_acquire(previous);
        self.counter.store(next)?;
        debug!("Capture refcount {} -> {}", previous, next);

        if transition == CounterTransition::Enable {
            if let Err(e) = self.set_bindings(true) {
                if let Err(restore) = self.counter.store(previous) {
                    error!("Failed to restore capture refcount: {}", restore);
                }
                return Err(e);
            }
        }

        Ok(EnablementGuard {
            enablement: self,
            armed: true,
        })
    }

    fn release(&self) -> Result<()> {
        let previous = self.counter.load()?;
        if previous == 0 {
            warn!("Capture refcount already at zero on release");
        }
        let (next, transition) = CounterTransition::on_release(previous);
        self.counter.store(next)?;
        debug!("Capture refcount {} -> {}", previous, next);

        if transition == CounterTransition::Disable {
            self.set_bindings(false)?;
        }
        Ok(())
    }

    fn set_bindings(&self, enabled: bool) -> Result<()> {
        let mut config = self.netcfg.begin(LOCK_CLIENT, LOCK_TIMEOUT)?;
        let component = config.find_component(CAPTURE_COMPONENT)?;
        let paths = config.binding_paths_above(component)?;
        for path in &paths {
            config.set_binding_enabled(*path, enabled)?;
        }
        config.apply()?;

        info!(
            "{} {} binding paths of {}",
            if enabled { "Enabled" } else { "Disabled" },
            paths.len(),
            CAPTURE_COMPONENT
        );
        Ok(())
    }
}

/// 持有一个捕获绑定引用，直到释放或 drop
pub struct EnablementGuard<'a> {
    enablement: &'a ProviderEnablement,
    armed: bool,
}

impl EnablementGuard<'_> {
    /// 释放引用，并返回 `Drop` 中只能记录日志的错误
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        self.enablement.release()
    }
}

impl Drop for EnablementGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.enablement.release() {
                error!("Failed to release packet capture binding: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CaptureError;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Clone, Default)]
    pub(crate) struct MemoryCounter(pub Rc<Cell<u32>>);

    impl CounterStore for MemoryCounter {
        fn load(&self) -> Result<u32> {
            Ok(self.0.get())
        }

        fn store(&self, value: u32) -> Result<()> {
            self.0.set(value);
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct NetCfgState {
        pub log: Vec<String>,
        pub enabled: Vec<bool>,
        pub locked: bool,
        pub held_by_other: bool,
        pub fail_set: bool,
        /// 在下一次成功 apply 之后执行一次
        pub on_apply: Option<Box<dyn FnOnce()>>,
    }

    /// `ms_ndiscap` 之上的两条绑定路径
    #[derive(Clone)]
    pub(crate) struct FakeNetCfg(pub Rc<RefCell<NetCfgState>>);

    impl FakeNetCfg {
        pub fn new() -> Self {
            Self(Rc::new(RefCell::new(NetCfgState {
                enabled: vec![false, false],
                ..NetCfgState::default()
            })))
        }

        pub fn log(&self) -> Vec<String> {
            self.0.borrow().log.clone()
        }

        pub fn bindings_enabled(&self) -> Vec<bool> {
            self.0.borrow().enabled.clone()
        }
    }

    struct FakeTransaction {
        state: Rc<RefCell<NetCfgState>>,
        staged: Vec<bool>,
    }

    impl NetworkConfigurationStore for FakeNetCfg {
        fn begin<'a>(
            &'a self,
            client: &str,
            _lock_timeout: Duration,
        ) -> Result<Box<dyn NetworkConfiguration + 'a>> {
            let mut state = self.0.borrow_mut();
            if state.held_by_other || state.locked {
                return Err(CaptureError::TimeoutError("other".to_string()));
            }
            state.locked = true;
            state.log.push(format!("lock {}", client));
            let staged = state.enabled.clone();
            Ok(Box::new(FakeTransaction {
                state: Rc::clone(&self.0),
                staged,
            }))
        }
    }

    impl NetworkConfiguration for FakeTransaction {
        fn find_component(&mut self, component: &str) -> Result<ComponentId> {
            if component != CAPTURE_COMPONENT {
                return Err(CaptureError::ConfigError(format!("{} not found", component)));
            }
            Ok(ComponentId(0))
        }

        fn binding_paths_above(&mut self, _component: ComponentId) -> Result<Vec<BindingPath>> {
            Ok((0..self.staged.len()).map(BindingPath).collect())
        }

        fn set_binding_enabled(&mut self, path: BindingPath, enabled: bool) -> Result<()> {
            if self.state.borrow().fail_set {
                return Err(CaptureError::ConfigError("binding refused".to_string()));
            }
            self.staged[path.0] = enabled;
            Ok(())
        }

        fn apply(&mut self) -> Result<()> {
            let hook = {
                let mut state = self.state.borrow_mut();
                state.enabled = self.staged.clone();
                state.log.push(format!("apply {:?}", self.staged));
                state.on_apply.take()
            };
            if let Some(hook) = hook {
                hook();
            }
            Ok(())
        }
    }

    impl Drop for FakeTransaction {
        fn drop(&mut self) {
            let mut state = self.state.borrow_mut();
            state.locked = false;
            state.log.push("unlock".to_string());
        }
    }

    fn enablement(start: u32) -> (ProviderEnablement, MemoryCounter, FakeNetCfg) {
        let counter = MemoryCounter::default();
        counter.0.set(start);
        let netcfg = FakeNetCfg::new();
        let enablement =
            ProviderEnablement::new(Box::new(counter.clone()), Box::new(netcfg.clone()));
        (enablement, counter, netcfg)
    }

    #[test]
    fn test_transitions() {
        assert_eq!(CounterTransition::on_acquire(0), (1, CounterTransition::Enable));
        assert_eq!(CounterTransition::on_acquire(3), (4, CounterTransition::Retain));
        assert_eq!(CounterTransition::on_release(1), (0, CounterTransition::Disable));
        assert_eq!(CounterTransition::on_release(4), (3, CounterTransition::Release));
        assert_eq!(CounterTransition::on_release(0), (0, CounterTransition::Disable));
        assert_eq!(
            CounterTransition::on_acquire(u32::MAX),
            (u32::MAX, CounterTransition::Retain)
        );
    }

    #[test]
    fn test_first_acquire_enables_last_release_disables() {
        let (enablement, counter, netcfg) = enablement(0);

        let guard = enablement.acquire().unwrap();
        assert_eq!(counter.0.get(), 1);
        assert_eq!(netcfg.bindings_enabled(), vec![true, true]);

        guard.release().unwrap();
        assert_eq!(counter.0.get(), 0);
        assert_eq!(netcfg.bindings_enabled(), vec![false, false]);
        assert_eq!(
            netcfg.log(),
            vec![
                "lock ndisdump",
                "apply [true, true]",
                "unlock",
                "lock ndisdump",
                "apply [false, false]",
                "unlock",
            ]
        );
    }

    #[test]
    fn test_other_users_keep_bindings() {
        let (enablement, counter, netcfg) = enablement(2);

        let guard = enablement.acquire().unwrap();
        assert_eq!(counter.0.get(), 3);
        guard.release().unwrap();
        assert_eq!(counter.0.get(), 2);
        assert!(netcfg.log().is_empty(), "no binding change while others capture");
    }

    #[test]
    fn test_nested_acquires() {
        let (enablement, counter, netcfg) = enablement(0);

        let first = enablement.acquire().unwrap();
        let second = enablement.acquire().unwrap();
        let third = enablement.acquire().unwrap();
        assert_eq!(counter.0.get(), 3);

        third.release().unwrap();
        first.release().unwrap();
        assert_eq!(netcfg.bindings_enabled(), vec![true, true]);

        second.release().unwrap();
        assert_eq!(counter.0.get(), 0);
        assert_eq!(netcfg.bindings_enabled(), vec![false, false]);
    }

    #[test]
    fn test_drop_releases() {
        let (enablement, counter, netcfg) = enablement(0);
        {
            let _guard = enablement.acquire().unwrap();
            assert_eq!(counter.0.get(), 1);
        }
        assert_eq!(counter.0.get(), 0);
        assert_eq!(netcfg.bindings_enabled(), vec![false, false]);
    }

    #[test]
    fn test_lock_timeout_rolls_back_counter() {
        let (enablement, counter, netcfg) = enablement(0);
        netcfg.0.borrow_mut().held_by_other = true;

        let err = enablement.acquire().err().unwrap();
        assert!(matches!(err, CaptureError::TimeoutError(_)));
        assert_eq!(counter.0.get(), 0);
    }

    #[test]
    fn test_failed_binding_change_is_not_applied() {
        let (enablement, counter, netcfg) = enablement(0);
        netcfg.0.borrow_mut().fail_set = true;

        assert!(matches!(
            enablement.acquire(),
            Err(CaptureError::ConfigError(_))
        ));
        assert_eq!(counter.0.get(), 0);
        assert_eq!(netcfg.bindings_enabled(), vec![false, false]);
        assert_eq!(netcfg.log(), vec!["lock ndisdump", "unlock"]);
    }
}
