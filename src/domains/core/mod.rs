pub mod blob_storage_service;
