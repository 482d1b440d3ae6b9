use std::fmt;

/// The data streams of one fetch.
///
/// The declaration order is the order in which the fields appear in every
/// fetch reply and in which the sub-commands are concatenated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FetchKind {
    Bx,
    By,
    Bz,
    Timestamp,
    Temperature,
}

impl FetchKind {
    pub const ALL: [FetchKind; 5] = [
        FetchKind::Bx,
        FetchKind::By,
        FetchKind::Bz,
        FetchKind::Timestamp,
        FetchKind::Temperature,
    ];

    pub const AXES: [FetchKind; 3] = [FetchKind::Bx, FetchKind::By, FetchKind::Bz];

    /// Axis letter used by the array fetch, for the field components
    pub fn axis(self) -> Option<char> {
        match self {
            FetchKind::Bx => Some('X'),
            FetchKind::By => Some('Y'),
            FetchKind::Bz => Some('Z'),
            FetchKind::Timestamp | FetchKind::Temperature => None,
        }
    }

    pub(crate) fn query_name(self) -> &'static str {
        match self {
            FetchKind::Bx | FetchKind::By | FetchKind::Bz => "ARRay",
            FetchKind::Timestamp => "TIMESTAMP",
            FetchKind::Temperature => "TEMPERATURE",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FetchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchKind::Bx => "Bx",
            FetchKind::By => "By",
            FetchKind::Bz => "Bz",
            FetchKind::Timestamp => "Timestamp",
            FetchKind::Temperature => "Temperature",
        })
    }
}

/// One decoded fetch: `block_size` values for every [`FetchKind`].
///
/// Field values are raw integer counts in binary format and tesla in ASCII
/// format, timestamps are seconds, temperature is the raw sensor code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleCycle {
    channels: [Vec<f64>; 5],
}

impl SampleCycle {
    pub(crate) fn from_channels(channels: [Vec<f64>; 5]) -> Self {
        Self { channels }
    }

    pub fn get(&self, kind: FetchKind) -> &[f64] {
        &self.channels[kind.index()]
    }

    /// Samples per channel
    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every sample appended since the acquisition started, per [`FetchKind`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    channels: [Vec<f64>; 5],
    cycles: usize,
}

impl Accumulator {
    pub fn append(&mut self, cycle: &SampleCycle) {
        for (stack, values) in self.channels.iter_mut().zip(&cycle.channels) {
            stack.extend_from_slice(values);
        }
        self.cycles += 1;
    }

    pub fn clear(&mut self) {
        self.channels.iter_mut().for_each(Vec::clear);
        self.cycles = 0;
    }

    pub fn get(&self, kind: FetchKind) -> &[f64] {
        &self.channels[kind.index()]
    }

    /// Number of cycles appended
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// Samples per channel
    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
