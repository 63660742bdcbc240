pub mod command_matcher;
pub mod gate;
pub mod permissions;
pub mod prompt;

pub use gate::AuthorizationGate;
pub use permissions::PermissionStore;
pub use prompt::TerminalChooser;
