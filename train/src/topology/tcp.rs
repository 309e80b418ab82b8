use super::collective::Collective;
use crate::common::*;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A star-shaped collective over TCP.
///
/// Rank 0 listens on the rendezvous address and every other rank connects to
/// it. Reductions are summed on rank 0 in rank order and sent back, so all
/// ranks observe bitwise identical results. Values are staged through host
/// memory.
///
/// Rank 0 holds the rendezvous address until the collective is dropped, so
/// joining again without leaving fails.
#[derive(Debug)]
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    /// On rank 0 the streams of ranks `1..world_size` in rank order,
    /// otherwise the stream to rank 0.
    peers: Vec<TcpStream>,
    listener: Option<TcpListener>,
}

impl TcpCollective {
    /// Joins the group at the rendezvous address.
    ///
    /// It fails with a topology error if the rank is out of range, if peers
    /// disagree on the world size or if the group is not complete within the
    /// timeout.
    pub fn connect(
        rank: usize,
        world_size: usize,
        rendezvous_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(SegError::topology(format!(
                "invalid rank {} for world size {}",
                rank, world_size
            ))
            .into());
        }

        let (listener, peers) = if rank == 0 {
            let (listener, peers) = accept_peers(world_size, rendezvous_addr, timeout)?;
            (Some(listener), peers)
        } else {
            let stream = connect_root(rank, world_size, rendezvous_addr, timeout)?;
            (None, vec![stream])
        };

        for stream in &peers {
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(timeout))?;
        }

        Ok(Self {
            rank,
            world_size,
            peers,
            listener,
        })
    }

    fn send(stream: &mut TcpStream, values: &[f32]) -> Result<()> {
        stream.write_all(&(values.len() as u64).to_le_bytes())?;
        stream.write_all(bytemuck::cast_slice(values))?;
        Ok(())
    }

    fn recv(stream: &mut TcpStream, len: usize) -> Result<Vec<f32>> {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header)?;
        let peer_len = u64::from_le_bytes(header) as usize;
        if peer_len != len {
            return Err(SegError::topology(format!(
                "peer sent {} values, but {} are expected",
                peer_len, len
            ))
            .into());
        }

        let mut values = vec![0f32; len];
        stream.read_exact(bytemuck::cast_slice_mut(&mut values))?;
        Ok(values)
    }

    fn peer_error(&self, peer_rank: usize, err: Error) -> Error {
        err.context(SegError::topology(format!(
            "rank {} lost its connection to rank {}",
            self.rank, peer_rank
        )))
    }
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }

        if self.rank == 0 {
            for index in 0..self.peers.len() {
                let received = Self::recv(&mut self.peers[index], values.len())
                    .map_err(|err| self.peer_error(index + 1, err))?;
                izip!(values.iter_mut(), received).for_each(|(sum, value)| *sum += value);
            }
            for index in 0..self.peers.len() {
                Self::send(&mut self.peers[index], values)
                    .map_err(|err| self.peer_error(index + 1, err))?;
            }
        } else {
            Self::send(&mut self.peers[0], values).map_err(|err| self.peer_error(0, err))?;
            let received =
                Self::recv(&mut self.peers[0], values.len()).map_err(|err| self.peer_error(0, err))?;
            values.copy_from_slice(&received);
        }

        Ok(())
    }

    fn broadcast(&mut self, values: &mut [f32]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }

        if self.rank == 0 {
            for index in 0..self.peers.len() {
                Self::send(&mut self.peers[index], values)
                    .map_err(|err| self.peer_error(index + 1, err))?;
            }
        } else {
            let received =
                Self::recv(&mut self.peers[0], values.len()).map_err(|err| self.peer_error(0, err))?;
            values.copy_from_slice(&received);
        }

        Ok(())
    }
}

fn accept_peers(
    world_size: usize,
    rendezvous_addr: SocketAddr,
    timeout: Duration,
) -> Result<(TcpListener, Vec<TcpStream>)> {
    let listener = TcpListener::bind(rendezvous_addr).map_err(|err| {
        SegError::topology(format!(
            "unable to listen on rendezvous address {}: {}",
            rendezvous_addr, err
        ))
    })?;
    listener.set_nonblocking(true)?;

    let deadline = Instant::now() + timeout;
    let mut slots: Vec<Option<TcpStream>> = iter::repeat_with(|| None).take(world_size - 1).collect();

    while slots.iter().any(|slot| slot.is_none()) {
        let (mut stream, peer_addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    let missing = slots
                        .iter()
                        .enumerate()
                        .filter(|(_, slot)| slot.is_none())
                        .map(|(index, _)| index + 1)
                        .collect_vec();
                    return Err(SegError::topology(format!(
                        "ranks {:?} did not join within {:?}",
                        missing, timeout
                    ))
                    .into());
                }
                thread::sleep(RETRY_INTERVAL);
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(timeout))?;

        let mut hello = [0u8; 16];
        stream.read_exact(&mut hello)?;
        let peer_rank = u64::from_le_bytes(hello[0..8].try_into()?) as usize;
        let peer_world_size = u64::from_le_bytes(hello[8..16].try_into()?) as usize;

        if peer_world_size != world_size {
            return Err(SegError::topology(format!(
                "rank {} at {} expects world size {}, but it is {}",
                peer_rank, peer_addr, peer_world_size, world_size
            ))
            .into());
        }
        let slot = match peer_rank.checked_sub(1).and_then(|index| slots.get_mut(index)) {
            Some(slot) => slot,
            None => {
                return Err(SegError::topology(format!(
                    "invalid rank {} from {}",
                    peer_rank, peer_addr
                ))
                .into())
            }
        };
        if slot.is_some() {
            return Err(SegError::topology(format!("rank {} joined twice", peer_rank)).into());
        }

        debug!("rank {} joined from {}", peer_rank, peer_addr);
        stream.write_all(&(world_size as u64).to_le_bytes())?;
        *slot = Some(stream);
    }

    Ok((listener, slots.into_iter().flatten().collect()))
}

fn connect_root(
    rank: usize,
    world_size: usize,
    rendezvous_addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;

    let mut stream = loop {
        match TcpStream::connect(rendezvous_addr) {
            Ok(stream) => break stream,
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(SegError::topology(format!(
                        "rank {} failed to reach rendezvous address {}: {}",
                        rank, rendezvous_addr, err
                    ))
                    .into());
                }
                thread::sleep(RETRY_INTERVAL);
            }
        }
    };
    stream.set_read_timeout(Some(timeout))?;

    let mut hello = Vec::with_capacity(16);
    hello.extend_from_slice(&(rank as u64).to_le_bytes());
    hello.extend_from_slice(&(world_size as u64).to_le_bytes());
    stream.write_all(&hello)?;

    let mut ack = [0u8; 8];
    stream.read_exact(&mut ack).map_err(|err| {
        SegError::topology(format!("rank 0 rejected rank {}: {}", rank, err))
    })?;
    ensure!(
        u64::from_le_bytes(ack) as usize == world_size,
        "rank 0 acknowledged a different world size"
    );

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_addr() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        Ok(listener.local_addr()?)
    }

    fn spawn_group<F, T>(world_size: usize, f: F) -> Result<Vec<T>>
    where
        F: Fn(TcpCollective) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let addr = free_addr()?;
        let f = Arc::new(f);
        let handles = (0..world_size)
            .map(|rank| {
                let f = f.clone();
                thread::spawn(move || {
                    let collective =
                        TcpCollective::connect(rank, world_size, addr, Duration::from_secs(10))?;
                    f(collective)
                })
            })
            .collect_vec();
        handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| format_err!("thread panicked"))?)
            .collect()
    }

    #[test]
    fn all_reduce_and_broadcast() -> Result<()> {
        let results = spawn_group(3, |mut collective| {
            let rank = collective.rank() as f32;

            let mut sum = vec![rank, 10.0 * rank];
            collective.all_reduce_sum(&mut sum)?;

            let mut shared = vec![rank + 1.0; 3];
            collective.broadcast(&mut shared)?;

            collective.barrier()?;
            Ok((sum, shared))
        })?;

        for (sum, shared) in results {
            assert_eq!(sum, vec![3.0, 30.0]);
            assert_eq!(shared, vec![1.0; 3]);
        }
        Ok(())
    }

    #[test]
    fn average_tensors() -> Result<()> {
        let results = spawn_group(2, |mut collective| {
            let tensor = Tensor::of_slice(&[collective.rank() as f32 * 2.0, 4.0]);
            collective.all_reduce_mean(&[tensor.shallow_clone()])?;
            Ok(Vec::<f32>::from(&tensor))
        })?;

        for values in results {
            assert_eq!(values, vec![1.0, 4.0]);
        }
        Ok(())
    }

    #[test]
    fn detect_lost_peer() -> Result<()> {
        let results = spawn_group(2, |mut collective| {
            if collective.rank() == 1 {
                // leave without taking part in the reduction
                return Ok(None);
            }
            let mut values = vec![1.0];
            let err = collective.all_reduce_sum(&mut values).unwrap_err();
            Ok(SegError::find(&err).map(|err| matches!(err, SegError::Topology(_))))
        })?;
        assert_eq!(results[0], Some(true));
        Ok(())
    }

    /// Connects and sends a hello without waiting for the ack.
    fn join_raw(addr: SocketAddr, rank: u64, world_size: u64) -> Result<TcpStream> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => thread::sleep(RETRY_INTERVAL),
                Err(err) => return Err(err.into()),
            }
        };
        stream.write_all(&rank.to_le_bytes())?;
        stream.write_all(&world_size.to_le_bytes())?;
        Ok(stream)
    }

    fn is_topology_error(result: Result<TcpCollective>) -> bool {
        match result {
            Ok(_) => false,
            Err(err) => matches!(SegError::find(&err), Some(SegError::Topology(_))),
        }
    }

    #[test]
    fn reject_mismatched_world_size() -> Result<()> {
        let addr = free_addr()?;
        let root = thread::spawn(move || {
            is_topology_error(TcpCollective::connect(0, 2, addr, Duration::from_secs(10)))
        });
        let peer = TcpCollective::connect(1, 3, addr, Duration::from_secs(10));

        assert!(root.join().map_err(|_| format_err!("thread panicked"))?);
        assert!(is_topology_error(peer));
        Ok(())
    }

    #[test]
    fn reject_duplicated_rank() -> Result<()> {
        let addr = free_addr()?;
        let root = thread::spawn(move || {
            is_topology_error(TcpCollective::connect(0, 3, addr, Duration::from_secs(10)))
        });
        let _first = join_raw(addr, 1, 3)?;
        let _second = join_raw(addr, 1, 3)?;

        assert!(root.join().map_err(|_| format_err!("thread panicked"))?);
        Ok(())
    }

    #[test]
    fn hold_rendezvous_address_while_joined() -> Result<()> {
        let addr = free_addr()?;
        let peer = thread::spawn(move || {
            TcpCollective::connect(1, 2, addr, Duration::from_secs(10)).map(|_| ())
        });
        let collective = TcpCollective::connect(0, 2, addr, Duration::from_secs(10))?;
        peer.join().map_err(|_| format_err!("thread panicked"))??;

        assert!(is_topology_error(TcpCollective::connect(
            0,
            2,
            addr,
            Duration::from_millis(100)
        )));

        drop(collective);
        TcpListener::bind(addr)?;
        Ok(())
    }

    #[test]
    fn reject_invalid_rank() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 1));
        assert!(TcpCollective::connect(2, 2, addr, Duration::from_millis(10)).is_err());
    }
}
