//! Command authority arbitration
//!
//! Pure state machine deciding who may command the autopilot: the safety
//! pilot, the embedded safety layer, or the owning application. It is fed a
//! status snapshot per tick and emits actions for the caller to apply; it
//! performs no I/O itself, which keeps every transition unit-testable.

use serde::Serialize;

use fleetlink_shared::timing;

/// Who is in controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Authority {
    #[serde(rename = "PILOT")]
    Pilot,
    #[serde(rename = "SAFETY_LAYER")]
    SafetyLayer,
    #[serde(rename = "APPLICATION")]
    Application,
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pilot => "PILOT",
            Self::SafetyLayer => "SAFETY_LAYER",
            Self::Application => "APPLICATION",
        };
        f.write_str(name)
    }
}

/// Clearance switch progress; a handover consumes a full low-high-low cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clearance {
    Waiting,
    High,
    Cleared,
}

/// Everything the arbiter looks at, sampled once per tick
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub armable: bool,
    /// True when the ground station link is alive, or when none is required
    pub gcs_vital: bool,
    /// Observed flight mode matches the one last commanded by our own tasks
    pub mode_ok: bool,
    /// Observed flight mode is the handover baseline
    pub mode_baseline: bool,
    pub clearance_high: bool,
    pub midstick: bool,
    pub app_connected: bool,
    /// Seconds since the last message from the owning application
    pub owner_silence_s: f64,
    pub queue_idle: bool,
    pub landed_and_disarmed: bool,
}

/// Side effects the caller must apply after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RaiseAbort,
    ClearAbort,
    EnqueueReturn,
    ReportAppLost,
    WarnLinkDegraded,
}

pub struct Arbiter {
    authority: Authority,
    clearance: Clearance,
    link_warned: bool,
    /// Gate clearance cycling on a centered throttle stick
    midstick_check: bool,
}

impl Arbiter {
    pub fn new(midstick_check: bool) -> Self {
        Self {
            authority: Authority::Pilot,
            clearance: Clearance::Waiting,
            link_warned: false,
            midstick_check,
        }
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn clearance(&self) -> Clearance {
        self.clearance
    }

    /// Advance the machine by one tick
    pub fn tick(&mut self, status: &StatusSnapshot) -> Vec<Action> {
        match self.authority {
            Authority::Pilot => self.tick_pilot(status),
            Authority::Application => self.tick_application(status),
            Authority::SafetyLayer => self.tick_safety_layer(status),
        }
    }

    /// The owning application stepped back voluntarily
    pub fn app_disconnected(&mut self) -> Vec<Action> {
        if self.authority == Authority::Application {
            self.authority = Authority::SafetyLayer;
            self.link_warned = false;
            vec![Action::RaiseAbort]
        } else {
            Vec::new()
        }
    }

    fn tick_pilot(&mut self, status: &StatusSnapshot) -> Vec<Action> {
        // Track the clearance switch edges: low -> high -> low
        match self.clearance {
            Clearance::Waiting => {
                if status.clearance_high && (!self.midstick_check || status.midstick) {
                    self.clearance = Clearance::High;
                }
            }
            Clearance::High => {
                if !status.clearance_high {
                    self.clearance = Clearance::Cleared;
                }
            }
            Clearance::Cleared => {}
        }

        let handover = self.clearance == Clearance::Cleared
            && status.armable
            && status.gcs_vital
            && status.mode_baseline
            && status.app_connected;
        if handover {
            self.authority = Authority::Application;
            // The clearance is consumed; the next handover needs a new cycle
            self.clearance = Clearance::Waiting;
            self.link_warned = false;
            return vec![Action::ClearAbort];
        }
        Vec::new()
    }

    fn tick_application(&mut self, status: &StatusSnapshot) -> Vec<Action> {
        if !status.mode_ok {
            // The pilot flipped the flight mode: unconditional takeover
            self.authority = Authority::Pilot;
            self.clearance = Clearance::Waiting;
            return vec![Action::RaiseAbort];
        }
        if !status.app_connected || status.owner_silence_s >= timing::APP_LINK_LOST_S {
            self.authority = Authority::SafetyLayer;
            self.link_warned = false;
            return vec![
                Action::RaiseAbort,
                Action::EnqueueReturn,
                Action::ReportAppLost,
            ];
        }
        if status.owner_silence_s >= timing::APP_LINK_WARN_S {
            if !self.link_warned {
                self.link_warned = true;
                return vec![Action::WarnLinkDegraded];
            }
        } else {
            self.link_warned = false;
        }
        Vec::new()
    }

    fn tick_safety_layer(&mut self, status: &StatusSnapshot) -> Vec<Action> {
        if !status.mode_ok {
            self.authority = Authority::Pilot;
            self.clearance = Clearance::Waiting;
            return Vec::new();
        }
        if status.landed_and_disarmed && status.queue_idle {
            self.authority = Authority::Pilot;
            self.clearance = Clearance::Waiting;
            return Vec::new();
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nominal() -> StatusSnapshot {
        StatusSnapshot {
            armable: true,
            gcs_vital: true,
            mode_ok: true,
            mode_baseline: true,
            clearance_high: false,
            midstick: true,
            app_connected: true,
            owner_silence_s: 0.0,
            queue_idle: true,
            landed_and_disarmed: false,
        }
    }

    fn cycle_clearance(arbiter: &mut Arbiter, status: &StatusSnapshot) -> Vec<Action> {
        let mut high = *status;
        high.clearance_high = true;
        arbiter.tick(&high);
        arbiter.tick(status)
    }

    #[test]
    fn test_handover_requires_full_clearance_cycle() {
        let mut arbiter = Arbiter::new(true);
        let status = nominal();

        // Nothing happens without the switch cycle
        arbiter.tick(&status);
        assert_eq!(arbiter.authority(), Authority::Pilot);

        // A held-high switch is not enough
        let mut high = status;
        high.clearance_high = true;
        arbiter.tick(&high);
        assert_eq!(arbiter.authority(), Authority::Pilot);

        // Back to low completes the cycle and hands over
        let actions = arbiter.tick(&status);
        assert_eq!(arbiter.authority(), Authority::Application);
        assert_eq!(actions, vec![Action::ClearAbort]);
    }

    #[test]
    fn test_midstick_gates_clearance_when_enabled() {
        let mut arbiter = Arbiter::new(true);
        let mut status = nominal();
        status.midstick = false;
        cycle_clearance(&mut arbiter, &status);
        assert_eq!(arbiter.authority(), Authority::Pilot);
        assert_eq!(arbiter.clearance(), Clearance::Waiting);

        let mut arbiter = Arbiter::new(false);
        cycle_clearance(&mut arbiter, &status);
        assert_eq!(arbiter.authority(), Authority::Application);
    }

    #[test]
    fn test_handover_preconditions_are_all_required() {
        for broken in ["armable", "gcs", "mode", "app"] {
            let mut arbiter = Arbiter::new(true);
            let mut status = nominal();
            match broken {
                "armable" => status.armable = false,
                "gcs" => status.gcs_vital = false,
                "mode" => status.mode_baseline = false,
                _ => status.app_connected = false,
            }
            cycle_clearance(&mut arbiter, &status);
            assert_eq!(
                arbiter.authority(),
                Authority::Pilot,
                "handover must fail when {broken} precondition is broken"
            );
        }
    }

    #[test]
    fn test_mode_divergence_reverts_to_pilot() {
        let mut arbiter = Arbiter::new(true);
        let status = nominal();
        cycle_clearance(&mut arbiter, &status);
        assert_eq!(arbiter.authority(), Authority::Application);

        let mut diverged = status;
        diverged.mode_ok = false;
        let actions = arbiter.tick(&diverged);
        assert_eq!(arbiter.authority(), Authority::Pilot);
        assert_eq!(actions, vec![Action::RaiseAbort]);

        // The old clearance is gone; nominal ticks alone do not hand back
        arbiter.tick(&status);
        assert_eq!(arbiter.authority(), Authority::Pilot);
        cycle_clearance(&mut arbiter, &status);
        assert_eq!(arbiter.authority(), Authority::Application);
    }

    #[test]
    fn test_link_loss_escalation_warn_then_safety_layer() {
        let mut arbiter = Arbiter::new(true);
        let status = nominal();
        cycle_clearance(&mut arbiter, &status);

        // Below the warning threshold nothing happens
        let mut quiet = status;
        quiet.owner_silence_s = timing::APP_LINK_WARN_S - 0.1;
        assert!(arbiter.tick(&quiet).is_empty());

        // Degraded link warns exactly once
        quiet.owner_silence_s = timing::APP_LINK_WARN_S + 1.0;
        assert_eq!(arbiter.tick(&quiet), vec![Action::WarnLinkDegraded]);
        assert!(arbiter.tick(&quiet).is_empty());
        assert_eq!(arbiter.authority(), Authority::Application);

        // Just under the loss threshold there is still no takeover
        quiet.owner_silence_s = timing::APP_LINK_LOST_S - 0.1;
        assert!(arbiter.tick(&quiet).is_empty());
        assert_eq!(arbiter.authority(), Authority::Application);

        quiet.owner_silence_s = timing::APP_LINK_LOST_S;
        let actions = arbiter.tick(&quiet);
        assert_eq!(arbiter.authority(), Authority::SafetyLayer);
        assert_eq!(
            actions,
            vec![
                Action::RaiseAbort,
                Action::EnqueueReturn,
                Action::ReportAppLost
            ]
        );
    }

    #[test]
    fn test_link_recovery_resets_the_warning() {
        let mut arbiter = Arbiter::new(true);
        let status = nominal();
        cycle_clearance(&mut arbiter, &status);

        let mut quiet = status;
        quiet.owner_silence_s = timing::APP_LINK_WARN_S + 1.0;
        assert_eq!(arbiter.tick(&quiet), vec![Action::WarnLinkDegraded]);

        // The owner spoke again; the next degradation warns again
        arbiter.tick(&status);
        assert_eq!(arbiter.tick(&quiet), vec![Action::WarnLinkDegraded]);
    }

    #[test]
    fn test_safety_layer_hands_back_after_landing() {
        let mut arbiter = Arbiter::new(true);
        let status = nominal();
        cycle_clearance(&mut arbiter, &status);

        let mut lost = status;
        lost.owner_silence_s = timing::APP_LINK_LOST_S + 1.0;
        arbiter.tick(&lost);
        assert_eq!(arbiter.authority(), Authority::SafetyLayer);

        // Still flying home: no handback
        let mut returning = status;
        returning.queue_idle = false;
        arbiter.tick(&returning);
        assert_eq!(arbiter.authority(), Authority::SafetyLayer);

        let mut landed = status;
        landed.landed_and_disarmed = true;
        arbiter.tick(&landed);
        assert_eq!(arbiter.authority(), Authority::Pilot);
        assert_eq!(arbiter.clearance(), Clearance::Waiting);
    }

    #[test]
    fn test_pilot_can_interrupt_the_safety_return() {
        let mut arbiter = Arbiter::new(true);
        let status = nominal();
        cycle_clearance(&mut arbiter, &status);
        arbiter.app_disconnected();
        assert_eq!(arbiter.authority(), Authority::SafetyLayer);

        let mut diverged = status;
        diverged.mode_ok = false;
        arbiter.tick(&diverged);
        assert_eq!(arbiter.authority(), Authority::Pilot);
    }

    #[test]
    fn test_disconnect_only_matters_while_application_controls() {
        let mut arbiter = Arbiter::new(true);
        assert!(arbiter.app_disconnected().is_empty());
        assert_eq!(arbiter.authority(), Authority::Pilot);

        let status = nominal();
        cycle_clearance(&mut arbiter, &status);
        let actions = arbiter.app_disconnected();
        assert_eq!(actions, vec![Action::RaiseAbort]);
        assert_eq!(arbiter.authority(), Authority::SafetyLayer);
    }
}
