pub mod classifier;
pub mod context;
pub mod daemon;
pub mod dispatcher;
pub mod patch;
pub mod reupload;
pub mod scanner;
pub mod transport;
