// SPDX-License-Identifier: GPL-2.0

//! Runlists.
//!
//! A runlist is the list of TSGs the scheduler of a runlist id round-robins over. Each TSG is a
//! header entry followed by one entry per channel. Runlists are double buffered: the next list is
//! built in the buffer the hardware is not reading, then submitted.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::dma::{Aperture, DmaAllocator, DmaObject};
use crate::error::{self, code::*, Result};

/// Largest value of the timeslice timeout field the encoder produces before scaling.
pub(crate) const TIMESLICE_TIMEOUT_MAX: u32 = 127;
/// Saturated timeslice timeout.
pub(crate) const TIMESLICE_TIMEOUT_SATURATED: u32 = 63;
pub(crate) const TIMESLICE_SCALE_MAX: u32 = 7;

/// Priority of a TSG in the runlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum InterleaveLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// Encodes a timeslice as `(timeout, scale)` with `timeout << scale` close to `timeslice`.
pub(crate) fn encode_timeslice(timeslice: u32) -> (u32, u32) {
    let mut timeout = timeslice;
    let mut scale = 0;

    while timeout > TIMESLICE_TIMEOUT_MAX {
        timeout >>= 1;
        scale += 1;
    }

    if scale > TIMESLICE_SCALE_MAX {
        (TIMESLICE_TIMEOUT_SATURATED, TIMESLICE_SCALE_MAX)
    } else {
        (timeout, scale)
    }
}

/// Channel entry input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RunlistChannel {
    pub(crate) chid: u32,
    pub(crate) inst_addr: u64,
    pub(crate) inst_target: u32,
    pub(crate) userd_addr: u64,
    pub(crate) userd_target: u32,
}

/// TSG header input, with the channels that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunlistTsg {
    pub(crate) tsgid: u32,
    pub(crate) timeslice: u32,
    pub(crate) level: InterleaveLevel,
    pub(crate) channels: Vec<RunlistChannel>,
}

/// An entry decoded back from a runlist buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunlistEntry {
    Tsg {
        tsgid: u32,
        length: u32,
        timeout: u32,
        scale: u32,
    },
    Channel {
        chid: u32,
        /// Only Volta+ entries carry the instance block.
        inst_addr: Option<u64>,
    },
}

/// Chip-specific encoding of runlist entries.
pub(crate) trait RunlistFormat: Sync {
    /// Size of one entry, in 32-bit words.
    fn entry_words(&self) -> usize;

    /// Most channels one TSG header can cover.
    fn max_tsg_length(&self) -> usize;

    fn encode_tsg(&self, tsgid: u32, timeslice: u32, length: u32, out: &mut [u32]);

    fn encode_channel(&self, ch: &RunlistChannel, out: &mut [u32]);

    fn decode(&self, entry: &[u32]) -> RunlistEntry;

    fn entry_size(&self) -> usize {
        self.entry_words() * 4
    }
}

struct Builder<'a> {
    format: &'a dyn RunlistFormat,
    words: Vec<u32>,
    max_entries: usize,
}

impl Builder<'_> {
    fn append(&mut self, tsg: &RunlistTsg) -> Result {
        if self.words.len() / self.format.entry_words() + 1 + tsg.channels.len() > self.max_entries
        {
            return Err(ENOMEM);
        }

        let n = self.format.entry_words();
        let start = self.words.len();
        self.words.resize(start + n * (1 + tsg.channels.len()), 0);

        self.format.encode_tsg(
            tsg.tsgid,
            tsg.timeslice,
            tsg.channels.len() as u32,
            &mut self.words[start..start + n],
        );
        for (i, ch) in tsg.channels.iter().enumerate() {
            let off = start + n * (1 + i);
            self.format.encode_channel(ch, &mut self.words[off..off + n]);
        }

        Ok(())
    }

    fn append_level(&mut self, tsgs: &[&RunlistTsg]) -> Result {
        tsgs.iter().try_for_each(|tsg| self.append(tsg))
    }

    fn append_high(&mut self, high: &[&RunlistTsg]) -> Result {
        self.append_level(high)
    }

    /// Every medium TSG, each preceded by all the high ones.
    fn append_medium(&mut self, high: &[&RunlistTsg], medium: &[&RunlistTsg]) -> Result {
        for tsg in medium {
            self.append_high(high)?;
            self.append(tsg)?;
        }

        Ok(())
    }

    /// Every low TSG, each preceded by the medium (or, without any, the high) interleave.
    fn append_low(
        &mut self,
        high: &[&RunlistTsg],
        medium: &[&RunlistTsg],
        low: &[&RunlistTsg],
    ) -> Result {
        for tsg in low {
            if !medium.is_empty() {
                self.append_medium(high, medium)?;
            } else {
                self.append_high(high)?;
            }
            self.append(tsg)?;
        }

        Ok(())
    }
}

/// Builds the runlist words for `tsgs`.
///
/// With `interleave`, higher levels are repeated in front of each entry of the level below. If the
/// interleaved list does not fit in `max_entries`, each TSG appears once, in order.
pub(crate) fn build(
    format: &dyn RunlistFormat,
    tsgs: &[RunlistTsg],
    interleave: bool,
    max_entries: usize,
) -> Result<Vec<u32>> {
    if tsgs.iter().any(|t| t.channels.len() > format.max_tsg_length()) {
        return Err(EINVAL);
    }

    let mut b = Builder {
        format,
        words: Vec::new(),
        max_entries,
    };

    if interleave {
        let level = |l: InterleaveLevel| tsgs.iter().filter(|t| t.level == l).collect::<Vec<_>>();
        let high = level(InterleaveLevel::High);
        let medium = level(InterleaveLevel::Medium);
        let low = level(InterleaveLevel::Low);

        let res = if !low.is_empty() {
            b.append_low(&high, &medium, &low)
        } else if !medium.is_empty() {
            b.append_medium(&high, &medium)
        } else {
            b.append_high(&high)
        };

        match res {
            Ok(()) => return Ok(b.words),
            Err(_) => {
                debug!("runlist: interleave does not fit, using a flat list");
                b.words.clear();
            }
        }
    }

    let all = tsgs.iter().collect::<Vec<_>>();
    b.append_level(&all)?;

    Ok(b.words)
}

/// Decodes `words` back into entries.
pub(crate) fn decode(format: &dyn RunlistFormat, words: &[u32]) -> Vec<RunlistEntry> {
    words
        .chunks_exact(format.entry_words())
        .map(|e| format.decode(e))
        .collect()
}

struct RunlistState {
    bufs: [Arc<DmaObject>; 2],
    /// Buffer last submitted.
    cur: usize,
    /// Number of entries last submitted.
    count: u32,
    active_tsgs: BTreeSet<u32>,
}

/// One hardware runlist.
pub(crate) struct Runlist {
    pub(crate) id: u32,
    /// PBDMAs serving this runlist.
    pub(crate) pbdma_mask: u32,
    /// Engines scheduled from this runlist.
    pub(crate) eng_mask: u32,
    pub(crate) max_entries: usize,
    state: Mutex<RunlistState>,
}

impl Runlist {
    pub(crate) fn new(
        dma: &DmaAllocator,
        aperture: Aperture,
        id: u32,
        format: &dyn RunlistFormat,
        max_entries: usize,
    ) -> Result<Self> {
        let size = max_entries * format.entry_size();
        let bufs = [dma.alloc(size, aperture)?, dma.alloc(size, aperture)?];

        Ok(Self {
            id,
            pbdma_mask: 0,
            eng_mask: 0,
            max_entries,
            state: Mutex::new(RunlistState {
                bufs,
                cur: 0,
                count: 0,
                active_tsgs: BTreeSet::new(),
            }),
        })
    }

    pub(crate) fn active_tsgs(&self) -> BTreeSet<u32> {
        error::lock(&self.state).active_tsgs.clone()
    }

    /// Adds or removes `tsgid` from the TSGs the next reload puts in the list.
    pub(crate) fn set_active(&self, tsgid: u32, active: bool) {
        let mut state = error::lock(&self.state);
        if active {
            state.active_tsgs.insert(tsgid);
        } else {
            state.active_tsgs.remove(&tsgid);
        }
    }

    /// Writes `words` into the spare buffer and hands it to `submit`, which gets the buffer and
    /// the number of entries. The buffers are swapped once `submit` succeeds.
    pub(crate) fn update(
        &self,
        format: &dyn RunlistFormat,
        words: &[u32],
        submit: impl FnOnce(&DmaObject, u32) -> Result,
    ) -> Result {
        let mut state = error::lock(&self.state);
        let next = state.cur ^ 1;
        let buf = state.bufs[next].clone();

        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        if bytes.len() > buf.size() {
            warn!("runlist {}: {} bytes do not fit", self.id, bytes.len());
            return Err(ENOMEM);
        }
        buf.wr_n(0, &bytes)?;

        let count = (words.len() / format.entry_words()) as u32;
        submit(&buf, count)?;

        state.cur = next;
        state.count = count;

        Ok(())
    }

    /// Entries of the buffer last submitted.
    pub(crate) fn current(&self, format: &dyn RunlistFormat) -> Vec<RunlistEntry> {
        let state = error::lock(&self.state);
        let buf = &state.bufs[state.cur];
        let words = (0..state.count as usize * format.entry_words())
            .map(|i| buf.rd32(i * 4))
            .collect::<Vec<_>>();

        decode(format, &words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::hal::{fifo_hal, FifoHal};
    use crate::gpu::Chipset;
    use pretty_assertions::assert_eq;

    fn chan(chid: u32) -> RunlistChannel {
        RunlistChannel {
            chid,
            inst_addr: 0x1_0000_0000 + (u64::from(chid) << 12),
            inst_target: 2,
            userd_addr: 0x2000_0000 + u64::from(chid) * 512,
            userd_target: 2,
        }
    }

    fn tsg(tsgid: u32, level: InterleaveLevel, chids: &[u32]) -> RunlistTsg {
        RunlistTsg {
            tsgid,
            timeslice: 5000,
            level,
            channels: chids.iter().copied().map(chan).collect(),
        }
    }

    fn tsg_ids(entries: &[RunlistEntry]) -> Vec<u32> {
        entries
            .iter()
            .filter_map(|e| match e {
                RunlistEntry::Tsg { tsgid, .. } => Some(*tsgid),
                RunlistEntry::Channel { .. } => None,
            })
            .collect()
    }

    #[test]
    fn timeslice_scaling() {
        assert_eq!(encode_timeslice(100), (100, 0));
        assert_eq!(encode_timeslice(131), (65, 1));
        assert_eq!(encode_timeslice(5000), (78, 6));
        assert_eq!(encode_timeslice(u32::MAX), (63, 7));
    }

    #[test]
    fn header_carries_scaled_timeslice() {
        for chipset in [Chipset::GP10B, Chipset::GV11B] {
            let format = fifo_hal(chipset).runlist_format();
            let mut t = tsg(3, InterleaveLevel::Medium, &[1]);

            t.timeslice = 131;
            let words = build(format, &[t.clone()], false, 16).unwrap();
            assert_eq!(
                decode(format, &words)[0],
                RunlistEntry::Tsg {
                    tsgid: 3,
                    length: 1,
                    timeout: 65,
                    scale: 1
                }
            );

            t.timeslice = u32::MAX;
            let words = build(format, &[t], false, 16).unwrap();
            assert!(matches!(
                decode(format, &words)[0],
                RunlistEntry::Tsg {
                    timeout: 63,
                    scale: 7,
                    ..
                }
            ));
        }
    }

    #[test]
    fn build_then_decode_preserves_tsgs() {
        let sets: &[&[(u32, &[u32])]] = &[
            &[],
            &[(0, &[])],
            &[(0, &[0, 1, 2]), (5, &[7]), (9, &[3, 4])],
            &[(1, &[10]), (2, &[11]), (3, &[12]), (4, &[13, 14, 15, 16])],
        ];

        for chipset in [Chipset::GP10B, Chipset::GV11B, Chipset::TU104] {
            let format = fifo_hal(chipset).runlist_format();

            for set in sets {
                let tsgs = set
                    .iter()
                    .map(|(id, chids)| tsg(*id, InterleaveLevel::Medium, chids))
                    .collect::<Vec<_>>();
                let words = build(format, &tsgs, false, 1024).unwrap();

                let expected_entries: usize = tsgs.iter().map(|t| 1 + t.channels.len()).sum();
                assert_eq!(words.len() * 4, expected_entries * format.entry_size());

                // Regroup channel entries under the header preceding them.
                let mut parsed: Vec<(u32, u32, Vec<u32>)> = Vec::new();
                for e in decode(format, &words) {
                    match e {
                        RunlistEntry::Tsg { tsgid, length, .. } => {
                            parsed.push((tsgid, length, Vec::new()))
                        }
                        RunlistEntry::Channel { chid, inst_addr } => {
                            let last = parsed.last_mut().unwrap();
                            last.2.push(chid);
                            if let Some(addr) = inst_addr {
                                assert_eq!(addr, chan(chid).inst_addr);
                            }
                        }
                    }
                }

                let expected = tsgs
                    .iter()
                    .map(|t| {
                        (
                            t.tsgid,
                            t.channels.len() as u32,
                            t.channels.iter().map(|c| c.chid).collect::<Vec<_>>(),
                        )
                    })
                    .collect::<Vec<_>>();
                assert_eq!(parsed, expected);
                assert!(parsed.iter().all(|(_, len, chids)| *len as usize == chids.len()));
            }
        }
    }

    #[test]
    fn interleave_repeats_higher_levels() {
        let format = fifo_hal(Chipset::GV11B).runlist_format();
        let tsgs = [
            tsg(1, InterleaveLevel::Low, &[1]),
            tsg(2, InterleaveLevel::Low, &[2]),
            tsg(3, InterleaveLevel::Medium, &[3]),
            tsg(4, InterleaveLevel::High, &[4]),
        ];

        let words = build(format, &tsgs, true, 64).unwrap();
        assert_eq!(
            tsg_ids(&decode(format, &words)),
            vec![4, 3, 1, 4, 3, 2]
        );

        // Only high and medium.
        let words = build(format, &tsgs[2..], true, 64).unwrap();
        assert_eq!(tsg_ids(&decode(format, &words)), vec![4, 3]);

        // Falls back to a flat list when the interleave does not fit.
        let words = build(format, &tsgs, true, 8).unwrap();
        assert_eq!(tsg_ids(&decode(format, &words)), vec![1, 2, 3, 4]);

        // Without interleave.
        let words = build(format, &tsgs, false, 64).unwrap();
        assert_eq!(tsg_ids(&decode(format, &words)), vec![1, 2, 3, 4]);
    }

    #[test]
    fn overflow() {
        let format = fifo_hal(Chipset::GV11B).runlist_format();
        let tsgs = [tsg(1, InterleaveLevel::Medium, &[1, 2, 3])];

        assert_eq!(build(format, &tsgs, false, 3), Err(ENOMEM));

        let too_long = tsg(
            2,
            InterleaveLevel::Medium,
            &(0..format.max_tsg_length() as u32 + 1).collect::<Vec<_>>(),
        );
        assert_eq!(build(format, &[too_long], false, 4096), Err(EINVAL));
    }

    #[test]
    fn double_buffering() {
        let dma = DmaAllocator::new(false, false);
        let format = fifo_hal(Chipset::GV11B).runlist_format();
        let rl = Runlist::new(&dma, Aperture::Sysmem, 0, format, 16).unwrap();

        let mut submitted = Vec::new();
        for t in [1, 2] {
            let words = build(format, &[tsg(t, InterleaveLevel::Medium, &[t])], false, 16).unwrap();
            rl.update(format, &words, |buf, count| {
                submitted.push((buf.addr(), count));
                Ok(())
            })
            .unwrap();
        }

        assert_eq!(submitted.len(), 2);
        assert_ne!(submitted[0].0, submitted[1].0);
        assert_eq!(tsg_ids(&rl.current(format)), vec![2]);

        // A failed submit keeps the previous list.
        let words = build(format, &[tsg(3, InterleaveLevel::Medium, &[3])], false, 16).unwrap();
        assert_eq!(rl.update(format, &words, |_, _| Err(EBUSY)), Err(EBUSY));
        assert_eq!(tsg_ids(&rl.current(format)), vec![2]);
    }
}
