mod activation;
mod durability;
mod helpers;
mod index_changes;
mod location;
mod recovery;
mod reincarnation;
mod uniqueness;
