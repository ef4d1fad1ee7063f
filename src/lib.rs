pub mod config;
pub mod notes;
pub mod semantic;
#[cfg(test)]
mod tests;
