pub mod claude;
pub mod kiro_upstream;
