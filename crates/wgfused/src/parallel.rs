//! Collective operations between tensor-parallel participants.

use crate::error::{Error, Result};
use async_channel::{Receiver, Sender};

/// A participant of a tensor-parallel group.
///
/// Every participant of a group must call the collective operations in the same order and with
/// buffers of the same length.
pub trait Communicator {
    /// Index of this participant in its group.
    fn rank(&self) -> usize;
    /// Number of participants in the group.
    fn world_size(&self) -> usize;
    /// Identifier of the communication ring this participant belongs to.
    fn ring_id(&self) -> i32;
    /// Replaces `data` with the element-wise sum of the `data` of every participant.
    ///
    /// Blocks until the contributions of every participant are available. The contributions are
    /// summed in rank order so every participant ends up with bitwise-identical values.
    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()>;
}

/// A group containing a single participant: every collective is a no-op.
#[derive(Copy, Clone, Debug, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn ring_id(&self) -> i32 {
        -1
    }

    fn all_reduce_sum(&self, _data: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

/// A participant of a group of threads exchanging their contributions through channels.
pub struct ChannelGroup {
    rank: usize,
    ring_id: i32,
    // Indexed by peer rank, `None` at our own rank.
    to_peers: Vec<Option<Sender<Vec<f32>>>>,
    from_peers: Vec<Option<Receiver<Vec<f32>>>>,
}

impl ChannelGroup {
    /// Creates the `world_size` participants of a new group, ordered by rank.
    pub fn create(ring_id: i32, world_size: usize) -> Vec<Self> {
        let mut group: Vec<_> = (0..world_size)
            .map(|rank| Self {
                rank,
                ring_id,
                to_peers: vec![None; world_size],
                from_peers: vec![None; world_size],
            })
            .collect();

        for src in 0..world_size {
            for dst in 0..world_size {
                if src != dst {
                    let (snd, rcv) = async_channel::unbounded();
                    group[src].to_peers[dst] = Some(snd);
                    group[dst].from_peers[src] = Some(rcv);
                }
            }
        }

        group
    }

    fn failure(&self, reason: impl Into<String>) -> Error {
        Error::Collective {
            op: "all_reduce_sum",
            rank: self.rank,
            reason: reason.into(),
        }
    }
}

impl Communicator for ChannelGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.to_peers.len()
    }

    fn ring_id(&self) -> i32 {
        self.ring_id
    }

    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<()> {
        if self.world_size() == 1 {
            return Ok(());
        }

        log::trace!(
            "ring {}: rank {} reducing {} elements",
            self.ring_id,
            self.rank,
            data.len()
        );

        for (peer, snd) in self.to_peers.iter().enumerate() {
            if let Some(snd) = snd {
                snd.send_blocking(data.to_vec())
                    .map_err(|_| self.failure(format!("rank {peer} left the group")))?;
            }
        }

        let local = data.to_vec();
        data.fill(0.0);

        for (peer, rcv) in self.from_peers.iter().enumerate() {
            let contribution = match rcv {
                Some(rcv) => rcv
                    .recv_blocking()
                    .map_err(|_| self.failure(format!("rank {peer} left the group")))?,
                None => local.clone(),
            };

            if contribution.len() != data.len() {
                return Err(self.failure(format!(
                    "rank {peer} contributed {} elements, expected {}",
                    contribution.len(),
                    data.len()
                )));
            }

            data.iter_mut()
                .zip(&contribution)
                .for_each(|(acc, x)| *acc += x);
        }

        Ok(())
    }
}
