use crate::{ErrorCode, Mword, Smword};
use cpu::CpuSet;

/// Scheduling parameters for one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedParam {
    /// A non-negative class word is the priority itself.
    Legacy { prio: Mword, quantum: Mword },
    FixedPrio { prio: Mword, quantum: Mword },
    Wfq { quantum: Mword, weight: Mword },
    /// A class the kernel does not know.
    Unknown(Smword),
}

impl SchedParam {
    pub const FIXED_PRIO_CLASS: Smword = -1;
    pub const WFQ_CLASS: Smword = -2;

    /// The class word as it appears on the wire.
    pub fn class(&self) -> Smword {
        match *self {
            SchedParam::Legacy { prio, .. } => prio as Smword,
            SchedParam::FixedPrio { .. } => Self::FIXED_PRIO_CLASS,
            SchedParam::Wfq { .. } => Self::WFQ_CLASS,
            SchedParam::Unknown(class) => class,
        }
    }
}

/// A [`SchedParam`] together with the CPUs the thread may run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedParamMsg {
    pub cpus: CpuSet,
    pub param: SchedParam,
}

impl SchedParamMsg {
    /// Decodes scheduling parameters from message words.
    ///
    /// The layout is `[cpu set descriptor, cpu map, class, ...]`. With a non-negative
    /// class the fourth word is the quantum. With a negative class the fourth word is
    /// the byte length of the whole structure, followed by the class-specific words.
    pub fn decode(words: &[Mword]) -> Result<SchedParamMsg, ErrorCode> {
        if words.len() < 4 {
            return Err(ErrorCode::EInval);
        }
        let cpus = CpuSet::from_words(words[0] as u64, words[1] as u64);
        let class = words[2] as Smword;
        if class >= 0 {
            return Ok(SchedParamMsg {
                cpus,
                param: SchedParam::Legacy { prio: words[2], quantum: words[3] },
            });
        }

        let len_words = (words[3] + core::mem::size_of::<Mword>() - 1) / core::mem::size_of::<Mword>();
        if len_words > words.len() {
            return Err(ErrorCode::EInval);
        }
        let arg = |i: usize| words.get(i).copied().filter(|_| i < len_words).ok_or(ErrorCode::EInval);
        let param = match class {
            SchedParam::FIXED_PRIO_CLASS => SchedParam::FixedPrio { quantum: arg(4)?, prio: arg(5)? },
            SchedParam::WFQ_CLASS => SchedParam::Wfq { quantum: arg(4)?, weight: arg(5)? },
            other => SchedParam::Unknown(other),
        };
        Ok(SchedParamMsg { cpus, param })
    }

    /// Encodes into message words, the inverse of [`decode()`](Self::decode).
    pub fn encode(&self, out: &mut [Mword]) -> usize {
        out[0] = self.cpus.descr_word() as Mword;
        out[1] = self.cpus.map() as Mword;
        match self.param {
            SchedParam::Legacy { prio, quantum } => {
                out[2] = prio;
                out[3] = quantum;
                4
            }
            SchedParam::FixedPrio { prio, quantum } => {
                out[2] = SchedParam::FIXED_PRIO_CLASS as Mword;
                out[3] = 6 * core::mem::size_of::<Mword>();
                out[4] = quantum;
                out[5] = prio;
                6
            }
            SchedParam::Wfq { quantum, weight } => {
                out[2] = SchedParam::WFQ_CLASS as Mword;
                out[3] = 6 * core::mem::size_of::<Mword>();
                out[4] = quantum;
                out[5] = weight;
                6
            }
            SchedParam::Unknown(class) => {
                out[2] = class as Mword;
                out[3] = 4 * core::mem::size_of::<Mword>();
                4
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use cpu::{CpuId, CpuSet};

    #[test]
    fn legacy_params() {
        let words = [CpuSet::all().descr_word() as Mword, CpuSet::all().map() as Mword, 10, 0];
        let msg = SchedParamMsg::decode(&words).unwrap();
        assert_eq!(msg.param, SchedParam::Legacy { prio: 10, quantum: 0 });
        assert!(msg.cpus.contains(CpuId::new(3)));
    }

    #[test]
    fn negative_classes() {
        let mut words = [0; 8];
        let wfq = SchedParamMsg { cpus: CpuSet::all(), param: SchedParam::Wfq { quantum: 4000, weight: 2 } };
        let n = wfq.encode(&mut words);
        assert_eq!(SchedParamMsg::decode(&words[..n]), Ok(wfq));

        let fp = SchedParamMsg { cpus: CpuSet::all(), param: SchedParam::FixedPrio { prio: 300, quantum: 0 } };
        let n = fp.encode(&mut words);
        assert_eq!(SchedParamMsg::decode(&words[..n]), Ok(fp));

        // the declared length covers words that were not sent
        assert_eq!(SchedParamMsg::decode(&words[..5]), Err(ErrorCode::EInval));
        assert_eq!(SchedParamMsg::decode(&words[..3]), Err(ErrorCode::EInval));
    }

    #[test]
    fn unknown_class() {
        let words = [0, 1, -7isize as Mword, 32];
        assert_eq!(SchedParamMsg::decode(&words).unwrap().param, SchedParam::Unknown(-7));
    }
}
