use std::collections::VecDeque;

use super::command::{CommandKind, DramCommand};
use super::config::{DramConfig, TimingParameters};
use crate::sim::error::{SimError, SimResult};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Default)]
struct BankHistory {
    open_row: Option<u64>,
    last_act: Option<Cycle>,
    last_pre: Option<Cycle>,
    last_rd: Option<Cycle>,
    last_wr: Option<Cycle>,
}

#[derive(Debug, Clone, Default)]
struct RankHistory {
    banks: Vec<BankHistory>,
    // most recent activates, oldest first, at most four
    acts: VecDeque<Cycle>,
    last_wr: Option<Cycle>,
    last_ref: Option<Cycle>,
}

#[derive(Debug, Clone, Default)]
struct ChannelHistory {
    ranks: Vec<RankHistory>,
    last_col: Option<Cycle>,
    last_rd: Option<Cycle>,
    last_cmd: Option<Cycle>,
}

/// Replays issued commands against the timing parameters using only what was issued before,
/// independent of the scheduler's own bookkeeping.
#[derive(Debug, Clone)]
pub struct TimingChecker {
    timing: TimingParameters,
    channels: Vec<ChannelHistory>,
    checked: u64,
}

fn violation(cmd: &DramCommand, constraint: &'static str, earliest: Cycle) -> SimError {
    SimError::Timing {
        cycle: cmd.issued_at,
        command: cmd.to_string(),
        constraint,
        earliest,
    }
}

fn require(
    cmd: &DramCommand,
    last: Option<Cycle>,
    gap: Cycle,
    constraint: &'static str,
) -> SimResult<()> {
    match last {
        Some(at) if cmd.issued_at < at + gap => Err(violation(cmd, constraint, at + gap)),
        _ => Ok(()),
    }
}

impl TimingChecker {
    pub fn new(timing: TimingParameters, channels: usize, ranks: usize, banks: usize) -> Self {
        let rank = RankHistory {
            banks: vec![BankHistory::default(); banks],
            ..Default::default()
        };
        let channel = ChannelHistory {
            ranks: vec![rank; ranks],
            ..Default::default()
        };
        Self {
            timing,
            channels: vec![channel; channels],
            checked: 0,
        }
    }

    pub fn for_config(config: &DramConfig) -> Self {
        Self::new(config.timing, config.channels, config.ranks, config.banks)
    }

    pub fn checked(&self) -> u64 {
        self.checked
    }

    pub fn observe(&mut self, cmd: &DramCommand) -> SimResult<()> {
        let t = self.timing;
        let ch = self
            .channels
            .get_mut(cmd.channel)
            .ok_or_else(|| violation(cmd, "valid channel", cmd.issued_at))?;
        if let Some(last) = ch.last_cmd {
            if cmd.issued_at <= last {
                return Err(violation(cmd, "one command per cycle", last + 1));
            }
        }
        if cmd.issued_at < cmd.earliest {
            return Err(violation(cmd, "scheduler earliest", cmd.earliest));
        }
        let last_col = ch.last_col;
        let last_rd_ch = ch.last_rd;
        let rank = ch
            .ranks
            .get_mut(cmd.rank)
            .ok_or_else(|| violation(cmd, "valid rank", cmd.issued_at))?;

        match cmd.kind {
            CommandKind::Ref => {
                for bank in &rank.banks {
                    if bank.open_row.is_some() {
                        return Err(violation(cmd, "all banks precharged", cmd.issued_at));
                    }
                    require(cmd, bank.last_pre, t.tRP, "tRP")?;
                    require(cmd, bank.last_act, t.tRC, "tRC")?;
                }
                require(cmd, rank.last_ref, t.tRFC, "tRFC")?;
                rank.last_ref = Some(cmd.issued_at);
            }
            kind => {
                let last_ref = rank.last_ref;
                let rank_last_wr = rank.last_wr;
                let rank_last_act = rank.acts.back().copied();
                let faw_window = (rank.acts.len() == 4).then(|| rank.acts[0]);
                let bank = rank
                    .banks
                    .get_mut(cmd.bank)
                    .ok_or_else(|| violation(cmd, "valid bank", cmd.issued_at))?;
                match kind {
                    CommandKind::Act => {
                        if bank.open_row.is_some() {
                            return Err(violation(cmd, "bank precharged", cmd.issued_at));
                        }
                        require(cmd, bank.last_pre, t.tRP, "tRP")?;
                        require(cmd, bank.last_act, t.tRC, "tRC")?;
                        require(cmd, rank_last_act, t.tRRD, "tRRD")?;
                        require(cmd, faw_window, t.tFAW, "tFAW")?;
                        require(cmd, last_ref, t.tRFC, "tRFC")?;
                        bank.open_row = Some(cmd.row);
                        bank.last_act = Some(cmd.issued_at);
                        rank.acts.push_back(cmd.issued_at);
                        if rank.acts.len() > 4 {
                            rank.acts.pop_front();
                        }
                    }
                    CommandKind::Rd | CommandKind::Wr => {
                        if bank.open_row != Some(cmd.row) {
                            return Err(violation(cmd, "row open", cmd.issued_at));
                        }
                        require(cmd, bank.last_act, t.tRCD, "tRCD")?;
                        require(cmd, last_col, t.tCCD, "tCCD")?;
                        if kind == CommandKind::Rd {
                            require(cmd, rank_last_wr, t.write_to_read(), "tWTR")?;
                            bank.last_rd = Some(cmd.issued_at);
                            ch.last_rd = Some(cmd.issued_at);
                        } else {
                            require(cmd, last_rd_ch, t.tRTW, "tRTW")?;
                            bank.last_wr = Some(cmd.issued_at);
                            rank.last_wr = Some(cmd.issued_at);
                        }
                        ch.last_col = Some(cmd.issued_at);
                    }
                    CommandKind::Pre => {
                        if bank.open_row.is_none() {
                            return Err(violation(cmd, "bank open", cmd.issued_at));
                        }
                        require(cmd, bank.last_act, t.tRAS, "tRAS")?;
                        require(cmd, bank.last_rd, t.tRTP, "tRTP")?;
                        require(cmd, bank.last_wr, t.write_to_precharge(), "tWR")?;
                        bank.open_row = None;
                        bank.last_pre = Some(cmd.issued_at);
                    }
                    CommandKind::Ref => unreachable!(),
                }
            }
        }
        ch.last_cmd = Some(cmd.issued_at);
        self.checked += 1;
        Ok(())
    }
}

/// Validate a whole recorded command trace, in issue order.
pub fn check_trace<'a>(
    config: &DramConfig,
    commands: impl IntoIterator<Item = &'a DramCommand>,
) -> SimResult<u64> {
    let mut checker = TimingChecker::for_config(config);
    for cmd in commands {
        checker.observe(cmd)?;
    }
    Ok(checker.checked())
}

/// Check that no rank went longer than `tREFI` between refreshes (or from reset to its first
/// refresh) before `end`.
pub fn check_refresh_deadlines<'a>(
    config: &DramConfig,
    commands: impl IntoIterator<Item = &'a DramCommand>,
    end: Cycle,
) -> SimResult<()> {
    let mut last = vec![vec![0; config.ranks]; config.channels];
    for cmd in commands.into_iter().filter(|c| c.kind == CommandKind::Ref) {
        let prev = last[cmd.channel][cmd.rank];
        if cmd.issued_at > prev + config.timing.tREFI {
            return Err(violation(cmd, "tREFI", prev + config.timing.tREFI));
        }
        last[cmd.channel][cmd.rank] = cmd.issued_at;
    }
    for (channel, ranks) in last.iter().enumerate() {
        for (rank, &prev) in ranks.iter().enumerate() {
            if end > prev + config.timing.tREFI {
                return Err(SimError::Timing {
                    cycle: end,
                    command: format!("REF ch{channel} r{rank}"),
                    constraint: "tREFI",
                    earliest: prev + config.timing.tREFI,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dram::config::DramKind;

    fn cmd(kind: CommandKind, bank: usize, row: u64, at: Cycle) -> DramCommand {
        DramCommand {
            kind,
            channel: 0,
            rank: 0,
            bank,
            row,
            earliest: at,
            issued_at: at,
            completes_at: at,
        }
    }

    fn checker() -> TimingChecker {
        TimingChecker::new(TimingParameters::preset(DramKind::Ddr4), 1, 1, 8)
    }

    #[test]
    fn legal_act_rd_pre_sequence() {
        let t = TimingParameters::default();
        let mut c = checker();
        c.observe(&cmd(CommandKind::Act, 0, 5, 0)).unwrap();
        c.observe(&cmd(CommandKind::Rd, 0, 5, t.tRCD)).unwrap();
        c.observe(&cmd(CommandKind::Rd, 0, 5, t.tRCD + t.tCCD)).unwrap();
        c.observe(&cmd(CommandKind::Pre, 0, 5, t.tRAS)).unwrap();
        c.observe(&cmd(CommandKind::Act, 0, 6, t.tRC)).unwrap();
        assert_eq!(5, c.checked());
    }

    #[test]
    fn early_read_violates_trcd() {
        let mut c = checker();
        c.observe(&cmd(CommandKind::Act, 0, 5, 0)).unwrap();
        match c.observe(&cmd(CommandKind::Rd, 0, 5, 3)) {
            Err(SimError::Timing {
                constraint,
                earliest,
                ..
            }) => {
                assert_eq!("tRCD", constraint);
                assert_eq!(TimingParameters::default().tRCD, earliest);
            }
            other => panic!("expected tRCD violation, got {other:?}"),
        }
    }

    #[test]
    fn fifth_activate_inside_faw_window_is_rejected() {
        let t = TimingParameters::default();
        let mut c = checker();
        for bank in 0..4 {
            c.observe(&cmd(CommandKind::Act, bank, 1, bank as Cycle * t.tRRD))
                .unwrap();
        }
        let err = c
            .observe(&cmd(CommandKind::Act, 4, 1, 4 * t.tRRD))
            .unwrap_err();
        assert!(matches!(err, SimError::Timing { constraint: "tFAW", .. }));
    }

    #[test]
    fn refresh_needs_closed_banks() {
        let t = TimingParameters::default();
        let mut c = checker();
        c.observe(&cmd(CommandKind::Act, 0, 1, 0)).unwrap();
        assert!(c.observe(&cmd(CommandKind::Ref, 0, 0, 100)).is_err());
        c.observe(&cmd(CommandKind::Pre, 0, 1, 101)).unwrap();
        c.observe(&cmd(CommandKind::Ref, 0, 0, 101 + t.tRP)).unwrap();
        let err = c
            .observe(&cmd(CommandKind::Act, 0, 1, 101 + t.tRP + 1))
            .unwrap_err();
        assert!(matches!(err, SimError::Timing { constraint: "tRFC", .. }));
    }

    #[test]
    fn read_after_write_waits_for_twtr() {
        let t = TimingParameters::default();
        let mut c = checker();
        c.observe(&cmd(CommandKind::Act, 0, 1, 0)).unwrap();
        c.observe(&cmd(CommandKind::Wr, 0, 1, t.tRCD)).unwrap();
        let err = c
            .observe(&cmd(CommandKind::Rd, 0, 1, t.tRCD + t.tCCD))
            .unwrap_err();
        assert!(matches!(err, SimError::Timing { constraint: "tWTR", .. }));
    }

    #[test]
    fn refresh_deadline_check() {
        let config = DramConfig::default();
        let trefi = config.timing.tREFI;
        let refs = [
            cmd(CommandKind::Ref, 0, 0, trefi - 10),
            cmd(CommandKind::Ref, 0, 0, 2 * trefi - 20),
        ];
        let mut single_rank = config.clone();
        single_rank.channels = 1;
        assert!(check_refresh_deadlines(&single_rank, &refs, 2 * trefi).is_ok());
        assert!(check_refresh_deadlines(&single_rank, &refs, 4 * trefi).is_err());
    }
}
