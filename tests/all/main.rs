mod helpers;
mod listeners;
mod pools;
mod publishing;
