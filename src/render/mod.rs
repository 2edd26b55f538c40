pub mod overlay;
pub mod window;

pub use window::GraspViewer;
