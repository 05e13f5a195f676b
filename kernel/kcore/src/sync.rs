pub mod irq;
