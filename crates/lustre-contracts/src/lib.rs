pub mod blobs;
pub mod images;
pub mod ledger;
pub mod notices;
