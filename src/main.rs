use bytes::Bytes;
use raft_replica::{ApplyMsg, LocalNetwork, MemoryPersister, RaftClientConfig, RaftOptions, ReplicaId};
use slog::Drain;
use std::error::Error;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

const NUM_MEMBERS: usize = 3;
const NUM_COMMANDS: usize = 10;

// Runs a 3 replica cluster in-process, writes a few commands through the leader and waits for
// every replica to apply them.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let logger = create_root_logger_for_stdout();
    let network = LocalNetwork::new();

    let mut clients = Vec::with_capacity(NUM_MEMBERS);
    for i in 0..NUM_MEMBERS {
        let client = raft_replica::try_create_raft_client(RaftClientConfig {
            my_replica_id: i,
            peers: network.clients_for(ReplicaId::new(i), NUM_MEMBERS),
            persister: Arc::new(MemoryPersister::new()),
            info_logger: logger.clone(),
            options: RaftOptions::default(),
        })
        .await?;
        network.register(ReplicaId::new(i), &client.node);
        clients.push(client);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let leader = loop {
        if let Some(leader) = clients.iter().position(|c| c.node.get_state().is_leader) {
            break leader;
        }
        if Instant::now() > deadline {
            return Err("No leader elected".into());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    slog::info!(logger, "Replica {} is leader", leader);

    for i in 0..NUM_COMMANDS {
        let output = clients[leader].node.start(Bytes::from(format!("command-{}", i)))?;
        slog::info!(logger, "Proposed command-{} at {:?}", i, output.index);
    }

    for (i, client) in clients.iter_mut().enumerate() {
        let mut applied = 0;
        while applied < NUM_COMMANDS {
            match client.apply_stream.next().await {
                Some(ApplyMsg::Command { index, command, .. }) => {
                    slog::info!(logger, "Replica {} applied {:?} at {:?}", i, command, index);
                    applied += 1;
                }
                Some(ApplyMsg::Snapshot { index, .. }) => {
                    slog::info!(logger, "Replica {} installed snapshot through {:?}", i, index);
                }
                None => return Err("Apply stream closed early".into()),
            }
        }
    }

    for client in &clients {
        client.node.kill();
    }

    Ok(())
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
