pub mod governor;

pub use governor::{BudgetConfig, BudgetLevel, CostGovernor, GovernorSnapshot};
