use super::{
    collective::{Collective, NoopCollective},
    tcp::TcpCollective,
};
use crate::common::*;

/// The identity of one process in the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTopology {
    pub rank: usize,
    pub world_size: usize,
    /// The rendezvous address, set only in distributed mode.
    pub rendezvous_addr: Option<SocketAddr>,
    pub device: Device,
}

impl ProcessTopology {
    pub fn is_distributed(&self) -> bool {
        self.rendezvous_addr.is_some()
    }

    /// Rank 0 owns the output directory.
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }
}

/// The device a rank is bound to.
///
/// Ranks are spread round-robin over CUDA devices, or all run on the CPU if
/// there is none.
pub fn bind_device(rank: usize) -> Device {
    let count = tch::Cuda::device_count() as usize;
    if count == 0 {
        Device::Cpu
    } else {
        Device::Cuda(rank % count)
    }
}

/// A joined process group.
///
/// It is created by [ProcessGroup::initialize] and must be released by
/// [ProcessGroup::teardown] on the normal completion path.
pub struct ProcessGroup {
    topology: ProcessTopology,
    collective: Box<dyn Collective>,
}

impl ProcessGroup {
    /// The group of a process running alone on the device. It issues no
    /// communication.
    pub fn single(device: Device) -> Self {
        Self {
            topology: ProcessTopology {
                rank: 0,
                world_size: 1,
                rendezvous_addr: None,
                device,
            },
            collective: Box::new(NoopCollective),
        }
    }

    /// Joins the distributed group and binds the rank to a device.
    ///
    /// Initializing a rank twice without a teardown is a topology error. Rank 0
    /// fails at once since it still holds the rendezvous address, while other
    /// ranks time out waiting for rank 0 to acknowledge them.
    pub fn initialize(
        rank: usize,
        world_size: usize,
        rendezvous_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self> {
        let device = bind_device(rank);
        let collective = TcpCollective::connect(rank, world_size, rendezvous_addr, timeout)
            .with_context(|| format!("rank {} failed to join the process group", rank))?;
        info!(
            "rank {}/{} joined at {} on {:?}",
            rank, world_size, rendezvous_addr, device
        );

        Ok(Self {
            topology: ProcessTopology {
                rank,
                world_size,
                rendezvous_addr: Some(rendezvous_addr),
                device,
            },
            collective: Box::new(collective),
        })
    }

    pub fn topology(&self) -> &ProcessTopology {
        &self.topology
    }

    pub fn rank(&self) -> usize {
        self.topology.rank
    }

    pub fn world_size(&self) -> usize {
        self.topology.world_size
    }

    pub fn device(&self) -> Device {
        self.topology.device
    }

    pub fn collective(&mut self) -> &mut dyn Collective {
        self.collective.as_mut()
    }

    /// Waits for all ranks, then releases the connections.
    pub fn teardown(mut self) -> Result<()> {
        self.collective
            .barrier()
            .with_context(|| format!("rank {} failed to leave the group", self.rank()))?;
        debug!("rank {} left the process group", self.rank());
        Ok(())
    }
}

impl Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("topology", &self.topology)
            .finish()
    }
}
