mod points;

pub use points::PointsLedger;
