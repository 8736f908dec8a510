use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use cohort_group::{
    GroupMember,
    GroupTracker,
    HandlerId,
    Transport,
    TransportHandler,
    TransportView,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::command::{CommandRegistry, CommandService};
use crate::config::DispatcherConfig;
use crate::correlator::Correlator;
use crate::dispatcher::CommandDispatcher;
use crate::envelope::ClientId;
use crate::error::{CodecError, DispatchError};
use crate::pool::WorkerPool;
use crate::registry::{ClientRegistration, ClientRegistry};
use crate::statistics::DispatchStatistics;

/// Owns the request correlator and group tracker of a transport and hands
/// out a [CommandDispatcher] to each logical service sharing it.
///
/// ```rust
/// use cohort_dispatch::{
///     Command,
///     CommandDispatcherFactory,
///     CommandRegistry,
///     CommandService,
///     DispatcherConfig,
///     RkyvMarshaller,
/// };
/// use cohort_group::test_utils::ChannelNetwork;
/// use rkyv::{Archive, Deserialize, Serialize};
///
/// #[repr(C)]
/// #[derive(Serialize, Deserialize, Archive, Debug)]
/// #[archive(check_bytes)]
/// pub struct Ping(u64);
///
/// pub struct PingService;
///
/// impl CommandService for PingService {
///     type Marshaller = RkyvMarshaller;
///
///     fn register_commands(registry: &mut CommandRegistry<Self>) {
///         registry.add_command::<Ping>();
///     }
/// }
///
/// impl Command<PingService> for Ping {
///     type Output = u64;
///     type Error = ();
///
///     fn execute(self, _service: &PingService) -> Result<u64, ()> {
///         Ok(self.0 + 1)
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let network = ChannelNetwork::default();
///     let transport = network.create_transport("node-1");
///     transport.connect();
///
///     let factory = CommandDispatcherFactory::new(transport, DispatcherConfig::default())?;
///     let dispatcher =
///         factory.create_command_dispatcher("ping", PingService, RkyvMarshaller)?;
///
///     let me = dispatcher.local_member().clone();
///     let pong = dispatcher.dispatch_to_member(Ping(1), &me)?.await?;
///     assert_eq!(pong, 2);
///
///     factory.close();
///     Ok(())
/// }
/// ```
pub struct CommandDispatcherFactory {
    transport: Arc<dyn Transport>,
    tracker: GroupTracker,
    correlator: Arc<Correlator>,
    registry: Arc<ClientRegistry>,
    handler_id: Mutex<Option<HandlerId>>,
    closed: AtomicBool,
}

impl CommandDispatcherFactory {
    /// Creates a new factory for the transport.
    ///
    /// This spawns the worker threads used to execute commands received
    /// from other members.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        let runtime = match config.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| DispatchError::NoRuntime)?,
        };

        let pool = WorkerPool::spawn(
            "cohort-dispatch",
            config.worker_threads,
            config.worker_queue_capacity,
        )?;
        let worker_threads = pool.num_threads();

        let registry = Arc::new(ClientRegistry::default());
        let tracker = GroupTracker::start(transport.clone());
        let correlator = Arc::new(Correlator::new(
            transport.clone(),
            registry.clone(),
            pool,
            runtime,
            config.request_timeout,
        ));

        let handler = FactoryHandler {
            correlator: Arc::downgrade(&correlator),
        };
        let handler_id = transport.add_handler(Arc::new(handler));

        info!(
            local_member = ?tracker.local_member(),
            worker_threads = worker_threads,
            request_timeout = ?config.request_timeout,
            "Command dispatcher factory started."
        );

        Ok(Self {
            transport,
            tracker,
            correlator,
            registry,
            handler_id: Mutex::new(Some(handler_id)),
            closed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn tracker(&self) -> &GroupTracker {
        &self.tracker
    }

    #[inline]
    pub fn local_member(&self) -> &GroupMember {
        self.tracker.local_member()
    }

    #[inline]
    /// Gets the live dispatch statistics.
    pub fn statistics(&self) -> DispatchStatistics {
        self.correlator.statistics()
    }

    #[inline]
    /// The number of requests still waiting on a reply.
    pub fn num_pending_requests(&self) -> usize {
        self.correlator.num_pending()
    }

    #[inline]
    /// The number of services currently registered.
    pub fn num_clients(&self) -> usize {
        self.registry.len()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers a logical service and creates the dispatcher for it.
    ///
    /// Fails if a service is already registered with the same client id.
    pub fn create_command_dispatcher<Svc>(
        &self,
        client_id: impl Into<ClientId>,
        service: Svc,
        marshaller: Svc::Marshaller,
    ) -> Result<CommandDispatcher<Svc>, DispatchError>
    where
        Svc: CommandService,
    {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let client_id = client_id.into();
        if client_id.as_bytes().len() > u16::MAX as usize {
            return Err(CodecError::Encode(format!(
                "client id is {} bytes long, the limit is {}",
                client_id.as_bytes().len(),
                u16::MAX,
            ))
            .into());
        }

        let service = Arc::new(service);
        let marshaller = Arc::new(marshaller);

        let mut registry = CommandRegistry::new(service.clone(), marshaller.clone());
        Svc::register_commands(&mut registry);
        self.registry.register(
            client_id.clone(),
            ClientRegistration::new(registry.into_invokers()),
        )?;

        let clients = Arc::downgrade(&self.registry);
        let registered_id = client_id.clone();
        let cleanup = Box::new(move || {
            if let Some(clients) = clients.upgrade() {
                clients.deregister(&registered_id);
            }
        });

        info!(
            client_id = %client_id,
            local_member = ?self.tracker.local_member(),
            "Registered command dispatcher."
        );

        Ok(CommandDispatcher::new(
            client_id,
            service,
            marshaller,
            self.correlator.clone(),
            self.tracker.clone(),
            cleanup,
        ))
    }

    /// Detaches from the transport and stops executing received commands.
    ///
    /// Outstanding requests are not completed by this, each is resolved by its
    /// reply or its own timeout. Calling this more than once has no effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handler_id) = self.handler_id.lock().take() {
            self.transport.remove_handler(handler_id);
        }

        self.tracker.close();
        self.correlator.close();

        info!(
            local_member = ?self.tracker.local_member(),
            "Command dispatcher factory closed."
        );
    }
}

/// Routes transport callbacks into the correlator.
struct FactoryHandler {
    correlator: Weak<Correlator>,
}

impl TransportHandler for FactoryHandler {
    fn on_view(&self, view: &TransportView) {
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.handle_view(view);
        }
    }

    fn on_message(&self, source: SocketAddr, payload: Bytes) {
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.handle_message(source, payload);
        }
    }

    fn on_suspect(&self, addr: SocketAddr) {
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.handle_suspect(addr);
        }
    }
}
