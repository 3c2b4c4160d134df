pub mod budget;
pub mod category;
pub mod expense;
pub mod periode_limit;

pub use budget::{BudgetConfig, BudgetPatch, NewBudget};
pub use category::Category;
pub use expense::{
    DateBound, Expense, ExpenseListItem, ExpenseOrder, ExpensePatch, ExpenseQuery, NewExpense, SortOrder,
};
pub use periode_limit::PeriodCounter;
