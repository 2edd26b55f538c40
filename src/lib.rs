pub mod cloud;
pub mod estimator;
pub mod image;
pub mod mailbox;
pub mod pipeline;
pub mod protocol;
pub mod render;
