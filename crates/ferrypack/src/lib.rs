pub mod combine;
pub mod compiler;
pub mod config;
pub mod dev_server;
pub mod dirs;
pub mod emit;
pub mod graph;
pub mod loader;
pub mod resolver;
pub mod rules;
pub mod scanner;
pub mod util;

pub use compiler::{Compilation, Compiler};
pub use config::{BundlerConfiguration, ConfigLoader, Mode, ModuleRule};
pub use dev_server::DevServer;
pub use loader::{Loader, LoaderContext, LoaderRegistry};
