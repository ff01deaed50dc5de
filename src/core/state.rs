//! 回合状态机：THINKING → ACTING → OBSERVING → (THINKING | REFLECTING) → DONE
//!
//! 初始状态 Thinking；终止状态 Done 与 Aborted。TurnMachine 同时持有硬性回合计数，
//! 超过上限时 begin_turn 返回 TurnLimitExceeded。

use serde::Serialize;

use crate::core::AgentError;

/// 回合循环所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Thinking,
    Acting,
    Observing,
    Reflecting,
    Done,
    Aborted,
}

impl LoopPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopPhase::Done | LoopPhase::Aborted)
    }

    /// 合法转移表；任何非终止状态都可以进入 Aborted
    pub fn can_transition_to(self, next: LoopPhase) -> bool {
        use LoopPhase::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Aborted)
                | (Thinking, Acting)
                | (Thinking, Reflecting)
                | (Acting, Observing)
                | (Observing, Thinking)
                | (Observing, Reflecting)
                | (Reflecting, Done)
        )
    }
}

/// 单次指令的状态机实例（不可重启：终止后需新建）
#[derive(Debug)]
pub struct TurnMachine {
    phase: LoopPhase,
    turn: usize,
    max_turns: usize,
}

impl TurnMachine {
    pub fn new(max_turns: usize) -> Self {
        Self {
            phase: LoopPhase::Thinking,
            turn: 0,
            max_turns,
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn turn(&self) -> usize {
        self.turn
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// 进入新一轮 Thinking；已用完回合数时返回 TurnLimitExceeded
    pub fn begin_turn(&mut self) -> Result<usize, AgentError> {
        debug_assert_eq!(self.phase, LoopPhase::Thinking);
        if self.turn >= self.max_turns {
            return Err(AgentError::TurnLimitExceeded(self.max_turns));
        }
        self.turn += 1;
        Ok(self.turn)
    }

    pub fn advance(&mut self, next: LoopPhase) {
        if !self.phase.can_transition_to(next) {
            debug_assert!(false, "illegal transition {:?} -> {:?}", self.phase, next);
            tracing::warn!(from = ?self.phase, to = ?next, "illegal loop transition");
        }
        self.phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_cycle_is_legal() {
        let mut m = TurnMachine::new(5);
        assert_eq!(m.begin_turn().unwrap(), 1);
        m.advance(LoopPhase::Acting);
        m.advance(LoopPhase::Observing);
        m.advance(LoopPhase::Thinking);
        assert_eq!(m.begin_turn().unwrap(), 2);
        m.advance(LoopPhase::Reflecting);
        m.advance(LoopPhase::Done);
        assert!(m.phase().is_terminal());
    }

    #[test]
    fn test_turn_limit() {
        let mut m = TurnMachine::new(2);
        m.begin_turn().unwrap();
        m.begin_turn().unwrap();
        let err = m.begin_turn().unwrap_err();
        assert!(matches!(err, AgentError::TurnLimitExceeded(2)));
        assert_eq!(m.turn(), 2);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        assert!(!LoopPhase::Done.can_transition_to(LoopPhase::Thinking));
        assert!(!LoopPhase::Aborted.can_transition_to(LoopPhase::Thinking));
        assert!(!LoopPhase::Thinking.can_transition_to(LoopPhase::Observing));
        assert!(LoopPhase::Acting.can_transition_to(LoopPhase::Aborted));
    }
}
