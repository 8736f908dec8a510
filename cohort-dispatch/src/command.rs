use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::codec::Marshal;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// The wire key of a command.
///
/// This is the CRC32 of the command's path so it is stable across builds
/// and across members running different binaries.
pub struct CommandKey(pub u32);

impl CommandKey {
    pub fn of<Svc, Cmd>() -> Self
    where
        Cmd: Command<Svc>,
    {
        Self(crc32fast::hash(Cmd::path().as_bytes()))
    }
}

/// A unit of work executed against the context of a logical service.
///
/// Commands are plain values, everything they act on is provided by the
/// service on the member executing them.
pub trait Command<Svc>: Send + 'static {
    /// The value produced by a successful execution.
    type Output: Send + 'static;
    /// The error produced by a failed execution.
    type Error: Send + 'static;

    /// The unique path of the command.
    ///
    /// Members must agree on the path for a command to be routed.
    fn path() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Executes the command.
    fn execute(self, service: &Svc) -> Result<Self::Output, Self::Error>;
}

/// A logical service which commands are executed against.
pub trait CommandService: Sized + Send + Sync + 'static {
    /// The marshaller used for this service's commands, results and errors.
    type Marshaller: Send + Sync + 'static;

    /// Register all commands this service can execute when received from
    /// another member.
    ///
    /// See [CommandRegistry] for more information.
    fn register_commands(registry: &mut CommandRegistry<Self>);
}

/// Links the commands of a service with the dispatch system at runtime.
///
/// The receiving side cannot know the type of an incoming command ahead of
/// time, commands which are not registered are answered as if the service
/// did not exist.
pub struct CommandRegistry<Svc>
where
    Svc: CommandService,
{
    service: Arc<Svc>,
    marshaller: Arc<Svc::Marshaller>,
    invokers: BTreeMap<CommandKey, Arc<dyn OpaqueInvoker>>,
}

impl<Svc> CommandRegistry<Svc>
where
    Svc: CommandService,
{
    pub(crate) fn new(service: Arc<Svc>, marshaller: Arc<Svc::Marshaller>) -> Self {
        Self {
            service,
            marshaller,
            invokers: BTreeMap::new(),
        }
    }

    /// Consumes the registry into the produced invokers.
    pub(crate) fn into_invokers(self) -> BTreeMap<CommandKey, Arc<dyn OpaqueInvoker>> {
        self.invokers
    }

    /// Adds a new command to the registry.
    pub fn add_command<Cmd>(&mut self)
    where
        Cmd: Command<Svc>,
        Svc::Marshaller: Marshal<Cmd> + Marshal<Cmd::Output> + Marshal<Cmd::Error>,
    {
        let phantom = PhantomInvoker::<Svc, Cmd> {
            service: self.service.clone(),
            marshaller: self.marshaller.clone(),
            _command: PhantomData,
        };

        self.invokers
            .insert(CommandKey::of::<Svc, Cmd>(), Arc::new(phantom));
    }
}

#[derive(Debug)]
/// The outcome of executing a received command.
pub(crate) enum Reply {
    Value(Vec<u8>),
    Exception(Vec<u8>),
    NoSuchService,
}

pub(crate) trait OpaqueInvoker: Send + Sync {
    fn invoke(&self, data: &[u8]) -> Reply;
}

struct PhantomInvoker<Svc, Cmd>
where
    Svc: CommandService,
{
    service: Arc<Svc>,
    marshaller: Arc<Svc::Marshaller>,
    _command: PhantomData<fn() -> Cmd>,
}

impl<Svc, Cmd> OpaqueInvoker for PhantomInvoker<Svc, Cmd>
where
    Svc: CommandService,
    Cmd: Command<Svc>,
    Svc::Marshaller: Marshal<Cmd> + Marshal<Cmd::Output> + Marshal<Cmd::Error>,
{
    fn invoke(&self, data: &[u8]) -> Reply {
        let command: Cmd = match Marshal::<Cmd>::unmarshal(&*self.marshaller, data) {
            Ok(command) => command,
            Err(e) => {
                warn!(command = Cmd::path(), error = %e, "Failed to decode received command.");
                return Reply::NoSuchService;
            },
        };

        let result = catch_unwind(AssertUnwindSafe(|| command.execute(&self.service)));

        match result {
            Ok(Ok(output)) => {
                match Marshal::<Cmd::Output>::marshal(&*self.marshaller, &output) {
                    Ok(buf) => Reply::Value(buf),
                    Err(e) => {
                        error!(command = Cmd::path(), error = %e, "Failed to encode command output.");
                        Reply::NoSuchService
                    },
                }
            },
            Ok(Err(err)) => match Marshal::<Cmd::Error>::marshal(&*self.marshaller, &err) {
                Ok(buf) => Reply::Exception(buf),
                Err(e) => {
                    error!(command = Cmd::path(), error = %e, "Failed to encode command error.");
                    Reply::NoSuchService
                },
            },
            Err(_) => {
                error!(command = Cmd::path(), "Command panicked while executing.");
                Reply::NoSuchService
            },
        }
    }
}
