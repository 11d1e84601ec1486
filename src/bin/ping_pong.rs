use anyhow::Result;
use machine_runtime::{
    ActionContext, ActionError, Event, Halt, MachineConfig, MachineId, MachineType, MonitorConfig,
    MonitorType, Runtime, RuntimeConfig,
};
use tracing::{debug, info};

const DEFAULT_ROUNDS: u32 = 3;

#[derive(Debug)]
struct Ping {
    client: MachineId,
    seq: u32,
}
impl Event for Ping {}

#[derive(Debug)]
struct Pong {
    seq: u32,
}
impl Event for Pong {}

#[derive(Debug)]
struct Sent;
impl Event for Sent {}

#[derive(Debug)]
struct Answered;
impl Event for Answered {}

#[derive(Default)]
struct Server {
    served: u32,
}

impl MachineType for Server {
    fn configure(config: &mut MachineConfig<Self>) {
        config.action("reply", |server, ctx| {
            let Some((client, seq)) = ctx.event::<Ping>().map(|ping| (ping.client.clone(), ping.seq)) else {
                return Ok(());
            };

            server.served += 1;
            debug!(%client, seq, served = server.served, "replying to ping");
            ctx.send(&client, Pong { seq })
        });

        config.state("Serving").start().on_event_do::<Ping>("reply");
    }
}

struct Client {
    server: Option<MachineId>,
    remaining: u32,
    sent: u32,
}

impl Client {
    fn new(rounds: u32) -> Self {
        Self {
            server: None,
            remaining: rounds,
            sent: 0,
        }
    }

    fn ping(&mut self, ctx: &mut ActionContext<'_, Self>) -> Result<(), ActionError> {
        let Some(server) = self.server.clone() else {
            return Err(ActionError::fault("client has no server"));
        };

        self.sent += 1;
        let client = ctx.id().clone();
        ctx.monitor::<Responsiveness, _>(Sent)?;
        ctx.send(
            &server,
            Ping {
                client,
                seq: self.sent,
            },
        )
    }
}

impl MachineType for Client {
    fn configure(config: &mut MachineConfig<Self>) {
        config
            .action("boot", |client, ctx| {
                let server = ctx.create_machine(Server::default())?;
                info!(%server, "created server");
                client.server = Some(server);
                ctx.goto("Playing")
            })
            .action("serve", |client, ctx| client.ping(ctx))
            .action("returned", |client, ctx| {
                let seq = ctx.event::<Pong>().map(|pong| pong.seq);
                ctx.monitor::<Responsiveness, _>(Answered)?;
                info!(?seq, "received pong");

                client.remaining = client.remaining.saturating_sub(1);
                if client.remaining == 0 {
                    return ctx.raise(Halt);
                }
                client.ping(ctx)
            });

        config.state("Init").start().on_entry("boot");
        config
            .state("Playing")
            .on_entry("serve")
            .on_event_do::<Pong>("returned");
    }

    fn on_halt(&mut self) {
        info!(sent = self.sent, "client finished");
    }
}

/// Every ping is eventually answered.
struct Responsiveness;

impl MonitorType for Responsiveness {
    fn configure(config: &mut MonitorConfig<Self>) {
        config
            .state("Answered")
            .start()
            .cold()
            .on_event_goto::<Sent>("Pending");
        config
            .state("Pending")
            .hot()
            .on_event_goto::<Answered>("Answered");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let rounds = std::env::var("ROUNDS")
        .ok()
        .and_then(|rounds| rounds.parse().ok())
        .unwrap_or(DEFAULT_ROUNDS);

    let runtime = Runtime::new(RuntimeConfig::default());
    runtime.register_monitor(Responsiveness)?;

    let client = runtime.create_machine(Client::new(rounds))?;
    info!(%client, rounds, "started client");

    runtime.wait_until_idle().await?;
    runtime.assert_no_monitor_in_hot_state()?;

    let state = runtime.machine_info(&client)?;
    info!(%client, ?state, "all pings answered");
    Ok(())
}
