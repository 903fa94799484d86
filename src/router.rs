//! Category → table routing
//!
//! Every category has exactly one route. A route names the table the event is
//! appended to and whether seeing it ends the consume loop; both parts apply
//! independently.

use std::fmt;

use crate::event::Category;

/// Accumulator tables, one CSV file each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    SchedulerTransition,
    WorkerTransition,
    WorkerTransfer,
    Graph,
    Worker,
    Client,
    Lifecycle,
    LogEvent,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::SchedulerTransition,
        Table::WorkerTransition,
        Table::WorkerTransfer,
        Table::Graph,
        Table::Worker,
        Table::Client,
        Table::Lifecycle,
        Table::LogEvent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::SchedulerTransition => "scheduler_transition",
            Table::WorkerTransition => "worker_transition",
            Table::WorkerTransfer => "worker_transfer",
            Table::Graph => "graph",
            Table::Worker => "worker",
            Table::Client => "client",
            Table::Lifecycle => "lifecycle",
            Table::LogEvent => "log_event",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.csv", self.as_str())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub table: Table,
    /// Consumer stops after this event
    pub stops: bool,
}

impl Route {
    const fn append(table: Table) -> Self {
        Self { table, stops: false }
    }

    const fn terminal(table: Table) -> Self {
        Self { table, stops: true }
    }
}

pub fn route(category: Category) -> Route {
    match category {
        Category::SchedulerTransition => Route::append(Table::SchedulerTransition),
        Category::WorkerTransition => Route::append(Table::WorkerTransition),
        Category::WorkerTransfer => Route::append(Table::WorkerTransfer),
        Category::UpdateGraph => Route::append(Table::Graph),
        Category::AddWorker | Category::RemoveWorker => Route::append(Table::Worker),
        Category::AddClient => Route::append(Table::Client),
        Category::RemoveClient => Route::terminal(Table::Client),
        Category::Close | Category::BeforeClose => Route::terminal(Table::Lifecycle),
        Category::Start | Category::Restart | Category::Teardown => {
            Route::append(Table::Lifecycle)
        }
        Category::LogEvent => Route::append(Table::LogEvent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn terminal_categories() {
        let stops: Vec<Category> = Category::ALL
            .into_iter()
            .filter(|c| route(*c).stops)
            .collect();
        assert_eq!(
            stops,
            vec![Category::BeforeClose, Category::Close, Category::RemoveClient]
        );
    }

    #[test]
    fn remove_client_is_recorded_and_stops() {
        let r = route(Category::RemoveClient);
        assert_eq!(r.table, Table::Client);
        assert!(r.stops);
    }

    #[test]
    fn membership_shares_tables() {
        assert_eq!(route(Category::AddWorker).table, route(Category::RemoveWorker).table);
        assert_eq!(route(Category::AddClient).table, Table::Client);
    }

    #[test]
    fn every_table_is_reachable() {
        for table in Table::ALL {
            assert!(
                Category::ALL.iter().any(|c| route(*c).table == table),
                "{table} has no category"
            );
        }
    }

    #[test]
    fn file_names() {
        assert_eq!(Table::Graph.file_name(), "graph.csv");
        assert_eq!(Table::SchedulerTransition.file_name(), "scheduler_transition.csv");
    }
}
