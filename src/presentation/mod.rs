pub mod app;

pub use app::RemoteApp;
