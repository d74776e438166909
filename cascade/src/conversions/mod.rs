pub mod urlenc;
