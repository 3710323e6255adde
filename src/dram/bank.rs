use serde::Serialize;

use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PowerState {
    Active,
    Standby,
    PowerDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerThresholds {
    pub standby: Cycle,
    pub powerdown: Cycle,
}

/// Cycles a bank spent in each power state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PowerResidency {
    pub active: Cycle,
    pub standby: Cycle,
    pub powerdown: Cycle,
}

impl PowerResidency {
    pub fn total(&self) -> Cycle {
        self.active + self.standby + self.powerdown
    }
}

impl std::ops::AddAssign for PowerResidency {
    fn add_assign(&mut self, rhs: Self) {
        self.active = self.active.saturating_add(rhs.active);
        self.standby = self.standby.saturating_add(rhs.standby);
        self.powerdown = self.powerdown.saturating_add(rhs.powerdown);
    }
}

/// Power state tracked lazily: the state at any cycle follows from the idle time since the last
/// activity, and residency is settled only when activity happens or a report is taken.
#[derive(Debug, Clone, Default)]
pub struct BankPower {
    last_activity: Cycle,
    settled_until: Cycle,
    settled: PowerResidency,
    // commands may not issue before this after a wake-up
    pub wake_ready: Cycle,
}

impl BankPower {
    pub fn state_at(&self, now: Cycle, th: PowerThresholds) -> PowerState {
        let idle = now.saturating_sub(self.last_activity);
        if idle >= th.powerdown {
            PowerState::PowerDown
        } else if idle >= th.standby {
            PowerState::Standby
        } else {
            PowerState::Active
        }
    }

    /// Residency over `[settled_until, now)` given the current idle run.
    fn unsettled(&self, now: Cycle, th: PowerThresholds) -> PowerResidency {
        let from = self.settled_until;
        if now <= from {
            return PowerResidency::default();
        }
        let standby_at = self.last_activity.saturating_add(th.standby);
        let powerdown_at = self.last_activity.saturating_add(th.powerdown);
        let span = |lo: Cycle, hi: Cycle| hi.min(now).saturating_sub(lo.max(from));
        PowerResidency {
            active: span(from, standby_at),
            standby: span(standby_at, powerdown_at),
            powerdown: span(powerdown_at, Cycle::MAX),
        }
    }

    /// Record activity at `now`. Returns true if the bank was powered down and has to wake.
    pub fn touch(&mut self, now: Cycle, th: PowerThresholds) -> bool {
        let was_down = self.state_at(now, th) == PowerState::PowerDown;
        let pending = self.unsettled(now, th);
        self.settled += pending;
        self.settled_until = self.settled_until.max(now);
        self.last_activity = now;
        was_down
    }

    pub fn residency(&self, now: Cycle, th: PowerThresholds) -> PowerResidency {
        let mut total = self.settled;
        total += self.unsettled(now, th);
        total
    }
}

/// Scheduler-side state of one bank.
#[derive(Debug, Clone, Default)]
pub struct BankState {
    pub open_row: Option<u64>,
    pub last_act: Option<Cycle>,
    pub last_pre: Option<Cycle>,
    // next-allowed cycles per command kind
    pub next_act: Cycle,
    pub next_pre: Cycle,
    pub next_col: Cycle,
    // column commands served from the currently open row
    pub hit_streak: u32,
    pub power: BankPower,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TH: PowerThresholds = PowerThresholds {
        standby: 16,
        powerdown: 128,
    };

    #[test]
    fn state_follows_idle_time() {
        let mut power = BankPower::default();
        power.touch(100, TH);
        assert_eq!(PowerState::Active, power.state_at(110, TH));
        assert_eq!(PowerState::Standby, power.state_at(116, TH));
        assert_eq!(PowerState::PowerDown, power.state_at(228, TH));
    }

    #[test]
    fn residency_splits_idle_runs() {
        let mut power = BankPower::default();
        // idle from 0: 16 active, 112 standby, 72 power-down
        let r = power.residency(200, TH);
        assert_eq!((16, 112, 72), (r.active, r.standby, r.powerdown));
        assert!(power.touch(200, TH));
        assert!(!power.touch(205, TH));
        let r = power.residency(210, TH);
        assert_eq!(210, r.total());
        assert_eq!((26, 112, 72), (r.active, r.standby, r.powerdown));
    }
}
