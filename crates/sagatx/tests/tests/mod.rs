mod coordinator;
mod saga;
