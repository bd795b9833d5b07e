mod mealy;
pub use mealy::{MealyMachine, MealyState, StateIndex};
