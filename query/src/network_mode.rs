use crate::OnlineManager;

/// Whether an execution may proceed while the network is offline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NetworkMode {
    /// Pause every attempt while offline.
    #[default]
    Online,
    /// Never pause.
    Always,
    /// Let the first attempt through, pause later ones while offline.
    OfflineFirst,
}

impl NetworkMode {
    /// Whether the `attempt`-th attempt (1-based) may run given the current connectivity.
    pub fn admits(&self, attempt: u32, online: bool) -> bool {
        match self {
            NetworkMode::Always => true,
            NetworkMode::Online => online,
            NetworkMode::OfflineFirst => online || attempt <= 1,
        }
    }
}

/// Checks each attempt against the network mode and waits out offline periods.
#[derive(Clone, Debug)]
pub(crate) struct NetworkModeGate {
    mode: NetworkMode,
    online: OnlineManager,
}

impl NetworkModeGate {
    pub(crate) fn new(mode: NetworkMode, online: OnlineManager) -> Self {
        Self { mode, online }
    }

    pub(crate) fn admit(&self, attempt: u32) -> bool {
        self.mode.admits(attempt, self.online.is_online())
    }

    pub(crate) async fn resume(&self) {
        self.online.wait_online().await
    }
}
