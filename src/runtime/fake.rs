//! In-memory launcher and probe for tests.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{LaunchSpec, Launcher, Readiness, ReadinessProbe, RuntimeError, RuntimeHandle};

#[derive(Default)]
pub(crate) struct FakeProcess {
    exit: Mutex<Option<i32>>,
    pub(crate) terminated: AtomicBool,
    pub(crate) killed: AtomicBool,
    pub(crate) ignore_term: bool,
}

impl FakeProcess {
    pub(crate) fn crash(&self, code: i32) {
        *self.exit.lock() = Some(code);
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.exit.lock().is_some()
    }
}

pub(crate) struct FakeHandle {
    process: Arc<FakeProcess>,
    pid: u32,
}

impl RuntimeHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(*self.process.exit.lock())
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.process.terminated.store(true, Ordering::SeqCst);
        if !self.process.ignore_term {
            self.process.crash(0);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.process.killed.store(true, Ordering::SeqCst);
        self.process.crash(-1);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeLauncher {
    pub(crate) launches: Mutex<Vec<(LaunchSpec, Arc<FakeProcess>)>>,
    pub(crate) ignore_term: bool,
    /// Processes die before becoming ready.
    pub(crate) crash_on_launch: bool,
}

impl FakeLauncher {
    pub(crate) fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub(crate) fn latest(&self, id: &str) -> Arc<FakeProcess> {
        self.launches
            .lock()
            .iter()
            .rev()
            .find(|(spec, _)| spec.project_id.as_str() == id)
            .map(|(_, process)| Arc::clone(process))
            .unwrap()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        let process = Arc::new(FakeProcess {
            ignore_term: self.ignore_term,
            ..FakeProcess::default()
        });
        if self.crash_on_launch {
            process.crash(1);
        }
        let mut launches = self.launches.lock();
        launches.push((spec.clone(), Arc::clone(&process)));
        Ok(Box::new(FakeHandle {
            process,
            pid: 1000 + launches.len() as u32,
        }))
    }
}

pub(crate) enum ProbeMode {
    Ready,
    Never,
    ReadyAfter(usize),
}

pub(crate) struct FakeProbe {
    mode: ProbeMode,
    probes: AtomicUsize,
}

impl FakeProbe {
    pub(crate) fn new(mode: ProbeMode) -> Self {
        Self {
            mode,
            probes: AtomicUsize::new(0),
        }
    }
}

impl ReadinessProbe for FakeProbe {
    fn probe(&self, _host: &str, _port: u16) -> Readiness {
        let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
        match self.mode {
            ProbeMode::Ready => Readiness::Ready,
            ProbeMode::Never => Readiness::NotReady(503),
            ProbeMode::ReadyAfter(after) if n > after => Readiness::Ready,
            ProbeMode::ReadyAfter(_) => Readiness::Unreachable,
        }
    }
}
