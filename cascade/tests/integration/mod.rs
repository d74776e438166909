mod admin_test;
mod cascade_test;
mod merge_test;
mod table_sync_test;
mod takeover_test;
