pub mod datatypes;
pub mod driver;
pub mod element;
pub mod error;
pub mod filter;
pub mod input;
pub mod linalg;
pub mod material;
pub mod mesher;
pub mod optimizer;
pub mod post_processor;
pub mod sensitivity;
pub mod solver;
