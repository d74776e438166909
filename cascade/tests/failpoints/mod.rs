mod worker_test;
