pub mod analytic;
pub mod evaluator;
pub mod external;
pub mod idpp;
pub mod kernel;
pub mod surface;
pub mod surrogate;
