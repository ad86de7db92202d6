pub mod bayes;
pub mod checkpoint;
pub mod classifier;
pub mod evaluation;
pub mod expansion;
pub mod gamma;
pub mod logging;
pub mod special;

#[path = "../pop/mod.rs"]
pub mod pop;
